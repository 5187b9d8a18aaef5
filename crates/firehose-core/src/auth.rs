//! Loader authentication strategies.
//!
//! Some programmers accept commands immediately, some gate flashing behind a
//! vendor handshake. The closed set of known handshakes lives here; the
//! session runs the selected one right after the loader comes up, before
//! `configure`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{CommandBuilder, FirehoseEngine, ProtocolError};
use crate::transport::Transport;

/// Built-in signatures tried blind by the Xiaomi bypass, newest first.
/// Harvested from devices where the EDL authorization server accepted them;
/// a loader that honors any of these unlocks without an account.
pub const XIAOMI_BUILTIN_SIGNATURES: [&str; 5] = [
    "BF35D6013A39D6166BE0387E6B9B00FD0E096283F811EDE81594866CF676B41B1A32EA67FBAB4F6D90E45C944B53302A1DA32D94F30A68E1EB116672B02920089AA938F91464D6926C42A93D0EAE88E549A49C00FCF9B1B89EF68A7CD23DEBEB88C01D850ACD52A832BB80134C4B0E2A7A1422E2530C19B309EBA1FF7E123A34DD3B83DCFACDCE45F303D135FE58899E531E1CF7155D48BFF18AB3E5FC1A2E85FBB015DE2A3CFC8EE51AA453F7DEBC4A095861DA1637C8DF4D9CF64EC4A5F45486AD73FB036965B94E1EE8F4077FFB54E90AF0AB52BF02E499517FB7D1028ABCBA1B98951843B2A8C964B4D94801BAF630C6179FA6F86371830A484F2792D491",
    "600000010800936E3A8E573CAD07C167644B61217835D85AD4FDDB7D840A2B7225432FCDA13A7C192CFA979ED16517E6970B1B07DF6C516FEC81F6968FCF7FFDDBC397A162C2CA3E5D76124AA1769F1B2164B39B76930B4CC67519F7F339877677F4E8AF25828682BCBF4E593A57E7E30532699253E0B1CC5D9D0D554AF2BD46D56F18D6E5290BA4A0CAC2431F9F19C4C1A39D7664FFAB48A9E11A559386819835B84DF5675E70D25FDB5123E7B040FE21108F0AE6D7D9D267F2C9C61AD054C68493DC4D33F74D0CF2D4AADCD430152DB67C22A181AD6D7761637F70CBDA884CDC11337203837790E6845CA5A8767930B9C26FDA71272564CA34763D352F5FE4",
    "936E3A8E573CAD07C167644B61217835D85AD4FDDB7D840A2B7225432FCDA13A7C192CFA979ED16517E6970B1B07DF6C516FEC81F6968FCF7FFDDBC397A162C2CA3E5D76124AA1769F1B2164B39B76930B4CC67519F7F339877677F4E8AF25828682BCBF4E59600000110532699253E0B1CC5D9D0D554AF2BD46D56F18D6E5290BA4A0CAC2431F9F19C4C1A39D7664FFAB48A9E11A559386819835B84DF5675E70D25FDB5123E7B040FE21108F0AE6D7D9D267F2C9C61AD054C68493DC4D33F74D0CF2D4AADCD430152DB67C22A181AD6D7761637F70CBDA884CDC11337203837790E6845CA5A8767930B9C26FDA71272564CA34763D352F5FE42AB738FB38A5",
    "936E3A8E573CAD07C167644B61217835D85AD4FDDB7D840A2B7225432FCDA13A7C192CFA979ED16517E6970B1B07DF6C516FEC81F6968FCF7FFDDBC397A162C2CA3E5D76124AA1769F1B2164B39B76930B4CC67519F7F339877677F4E8AF25828682BCBF4E593A57E7E30532699253E0B1CC5D9D0D554AF2BD46D56F18D6E5290BA4A0CAC2431F9F19C4C1A39D7664FFAB48A9E11A559386819835B84DF5675E70D25FDB5123E7B040FE21108F0AE6D7D9D267F2C9C61AD054C68493DC4D33F74D0CF2D4AADCD430152DB67C22A181AD6D7761637F70CBDA884CDC11337203837790E6845CA5A8767930B9C26FDA71272564CA34763D352F5FE42AB738FB38A5",
    "936E3A8E573CAD07C167644B61217835D85AD4FDDB7D840A2B7225432FCDA13A7C192CFA979ED16517E6970B1B07DF6C516FEC81F6968FCF7FFDDBC397A162C2CA3E5D76124AA1769F1B2164B39B76930B4CC67519F7F339877677F4E8AF25828682BCBF4E59600000020532699253E0B1CC5D9D0D554AF2BD46D56F18D6E5290BA4A0CAC2431F9F19C4C1A39D7664FFAB48A9E11A559386819835B84DF5675E70D25FDB5123E7B040FE21108F0AE6D7D9D267F2C9C61AD054C68493DC4D33F74D0CF2D4AADCD430152DB67C22A181AD6D7761637F70CBDA884CDC11337203837790E6845CA5A8767930B9C26FDA71272564CA34763D352F5FE42AB738FB38A5",
];

#[derive(Error, Debug)]
pub enum AuthError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Invalid signature hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Device rejected all authentication attempts")]
    Rejected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Called with the device challenge (hex) when no built-in signature worked;
/// returns the externally computed signature hex, or `None` to give up.
pub type ManualSignFn = dyn Fn(&str) -> Option<String> + Send + Sync;

pub struct XiaomiAuth {
    signatures: Vec<String>,
    manual_sign: Option<Box<ManualSignFn>>,
}

impl Default for XiaomiAuth {
    fn default() -> Self {
        Self {
            signatures: XIAOMI_BUILTIN_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            manual_sign: None,
        }
    }
}

impl XiaomiAuth {
    pub fn with_signatures(signatures: Vec<String>) -> Self {
        Self {
            signatures,
            manual_sign: None,
        }
    }

    pub fn manual_sign(mut self, f: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.manual_sign = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for XiaomiAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XiaomiAuth")
            .field("signatures", &self.signatures.len())
            .field("manual_sign", &self.manual_sign.is_some())
            .finish()
    }
}

/// Which handshake to run after the loader boots.
#[derive(Debug, Default)]
pub enum AuthStrategy {
    /// Loader accepts commands as-is.
    #[default]
    Standard,
    /// VIP programmers: push a digest table and signature found next to the
    /// programmer image. Loader-side rejections are logged, not fatal, since
    /// many loaders ship the VIP files but never enforce them.
    Vip { programmer_dir: PathBuf },
    /// Xiaomi EDL authorization bypass.
    Xiaomi(XiaomiAuth),
}

/// Run the selected handshake on a live engine.
pub fn authenticate<T: Transport>(
    engine: &mut FirehoseEngine<T>,
    strategy: &AuthStrategy,
) -> Result<(), AuthError> {
    match strategy {
        AuthStrategy::Standard => Ok(()),
        AuthStrategy::Vip { programmer_dir } => perform_vip_auth(engine, programmer_dir),
        AuthStrategy::Xiaomi(auth) => perform_xiaomi_auth(engine, auth),
    }
}

/// Push a signature blob: size announcement, raw bytes, acknowledgement.
/// A rejection is an ordinary `false`; callers try the next candidate.
pub fn send_signature<T: Transport>(engine: &mut FirehoseEngine<T>, signature: &[u8]) -> bool {
    let xml = CommandBuilder::new("sig")
        .attr("TargetName", "sig")
        .attr("verbose", 1)
        .attr("size_in_bytes", signature.len())
        .build();
    if engine.send_command(&xml).is_err() {
        return false;
    }
    if engine.write_raw(signature).is_err() {
        return false;
    }
    engine.wait_for_ack().is_ok()
}

fn find_vip_file(dir: &Path, stem: &str) -> Option<PathBuf> {
    for ext in ["bin", "mbn"] {
        let candidate = dir.join(format!("{stem}.{ext}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn perform_vip_auth<T: Transport>(
    engine: &mut FirehoseEngine<T>,
    programmer_dir: &Path,
) -> Result<(), AuthError> {
    let (Some(digest_path), Some(sig_path)) = (
        find_vip_file(programmer_dir, "digest"),
        find_vip_file(programmer_dir, "signature"),
    ) else {
        debug!(dir = %programmer_dir.display(), "No VIP files found, skipping handshake");
        return Ok(());
    };

    info!(digest = %digest_path.display(), "Starting VIP handshake");
    let settle = engine.retry_policy().idle;
    engine.purge();
    thread::sleep(settle);

    let digest = std::fs::read(&digest_path)?;
    engine.write_raw(&digest)?;
    thread::sleep(settle);

    engine.send_command_best_effort(
        &CommandBuilder::new("verify")
            .attr("value", "ping")
            .attr("EnableVip", 1)
            .build(),
    )?;
    thread::sleep(settle);

    let signature = std::fs::read(&sig_path)?;
    engine.write_raw(&signature)?;
    thread::sleep(settle);

    engine.send_command_best_effort(&CommandBuilder::new("sha256init").attr("Verbose", 1).build())?;
    engine.purge();
    info!("VIP handshake finished");
    Ok(())
}

fn perform_xiaomi_auth<T: Transport>(
    engine: &mut FirehoseEngine<T>,
    auth: &XiaomiAuth,
) -> Result<(), AuthError> {
    // Wake the loader before the first signature push.
    engine.send_command_best_effort(&CommandBuilder::new("nop").build())?;
    thread::sleep(engine.retry_policy().idle);

    for (index, hex_sign) in auth.signatures.iter().enumerate() {
        let Ok(bytes) = hex::decode(normalize_hex(hex_sign)) else {
            warn!(index, "Skipping malformed built-in signature");
            continue;
        };
        if send_signature(engine, &bytes) {
            info!(index, "Built-in signature accepted");
            return Ok(());
        }
    }

    debug!("Built-in signatures rejected, requesting challenge");
    let challenge = engine.send_command_with_attribute(
        &CommandBuilder::new("sig").attr("TargetName", "req").build(),
        "value",
    )?;

    let Some(blob) = challenge.filter(|b| !b.is_empty()) else {
        warn!("Loader offered no challenge and accepted no signature");
        return Err(AuthError::Rejected);
    };

    let blob_hex = normalize_blob(&blob);
    info!(len = blob_hex.len(), "Received challenge");

    if let Some(sign) = &auth.manual_sign {
        if let Some(user_hex) = sign(&blob_hex).filter(|s| !s.is_empty()) {
            let bytes = hex::decode(normalize_hex(&user_hex))?;
            if send_signature(engine, &bytes) {
                info!("Manually computed signature accepted");
                return Ok(());
            }
            warn!("Manually computed signature rejected");
        }
    }
    Err(AuthError::Rejected)
}

fn normalize_hex(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Loaders return the challenge either as hex or base64; normalize to
/// uppercase hex for signing tools.
fn normalize_blob(blob: &str) -> String {
    if looks_like_base64(blob) {
        if let Ok(bytes) = BASE64.decode(pad_base64(blob)) {
            return hex::encode_upper(bytes);
        }
    }
    blob.to_string()
}

fn looks_like_base64(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
        && (s.len() % 4 == 0 || s.len() > 20)
}

fn pad_base64(s: &str) -> String {
    match s.len() % 4 {
        0 => s.to_string(),
        rem => format!("{s}{}", "=".repeat(4 - rem)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RetryPolicy;
    use crate::transport::MockTransport;
    use std::time::Duration;

    fn engine() -> FirehoseEngine<MockTransport> {
        FirehoseEngine::with_retry_policy(
            MockTransport::new(),
            RetryPolicy {
                max_attempts: 3,
                poll_timeout: Duration::from_millis(1),
                idle: Duration::from_millis(1),
                ack_idle: Duration::from_millis(1),
                ..RetryPolicy::default()
            },
        )
    }

    #[test]
    fn test_standard_is_noop() {
        let mut engine = engine();
        authenticate(&mut engine, &AuthStrategy::Standard).unwrap();
        assert!(engine.transport().writes().is_empty());
    }

    #[test]
    fn test_vip_without_files_skips() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine();
        authenticate(
            &mut engine,
            &AuthStrategy::Vip {
                programmer_dir: dir.path().to_path_buf(),
            },
        )
        .unwrap();
        assert!(engine.transport().writes().is_empty());
    }

    #[test]
    fn test_vip_sequence_pushes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("digest.bin"), b"DIGESTDATA").unwrap();
        std::fs::write(dir.path().join("signature.mbn"), b"SIGDATA").unwrap();
        let mut engine = engine();
        authenticate(
            &mut engine,
            &AuthStrategy::Vip {
                programmer_dir: dir.path().to_path_buf(),
            },
        )
        .unwrap();

        let writes = engine.transport().write_strings();
        assert!(writes.iter().any(|w| w == "DIGESTDATA"));
        assert!(writes.iter().any(|w| w == "SIGDATA"));
        assert!(writes.iter().any(|w| w.contains("<verify") && w.contains("EnableVip=\"1\"")));
        assert!(writes.iter().any(|w| w.contains("<sha256init")));
    }

    #[test]
    fn test_xiaomi_second_signature_wins_without_challenge() {
        let mut engine = engine();
        // Ping answered, then the first candidate rejected at the header and
        // the second accepted end to end.
        engine.transport().queue_value("ACK");
        engine.transport().queue_value("NAK");
        engine.transport().queue_value("ACK");
        engine.transport().queue_value("ACK");

        let auth = XiaomiAuth::with_signatures(vec!["AA11".into(), "BB22".into()]);
        authenticate(&mut engine, &AuthStrategy::Xiaomi(auth)).unwrap();

        let writes = engine.transport().write_strings();
        let headers: Vec<_> = writes
            .iter()
            .filter(|w| w.contains("TargetName=\"sig\""))
            .collect();
        assert_eq!(headers.len(), 2);
        assert!(writes.iter().any(|w| w.as_bytes() == [0xBB, 0x22]));
        assert!(!writes.iter().any(|w| w.contains("TargetName=\"req\"")));
    }

    #[test]
    fn test_xiaomi_silent_loader_is_rejected() {
        let mut engine = engine();
        let auth = XiaomiAuth::with_signatures(vec![]);
        let err = authenticate(&mut engine, &AuthStrategy::Xiaomi(auth)).unwrap_err();
        assert!(matches!(err, AuthError::Rejected));
        // The challenge request did go out.
        assert!(
            engine
                .transport()
                .write_strings()
                .iter()
                .any(|w| w.contains("TargetName=\"req\""))
        );
    }

    #[test]
    fn test_blob_normalization() {
        // 20 raw bytes of zeros in base64.
        let b64 = "AAAAAAAAAAAAAAAAAAAAAAAAAAA=";
        assert_eq!(normalize_blob(b64), "00".repeat(20));
        // Short odd-length hex cannot be base64: left alone.
        assert_eq!(normalize_blob("BF35D6013A"), "BF35D6013A");
        assert_eq!(pad_base64("QUJD"), "QUJD");
        assert_eq!(pad_base64("QUJDRE["), "QUJDRE[=");
    }
}
