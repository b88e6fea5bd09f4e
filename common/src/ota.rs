use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct OtaApplyRequest {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub reboot: Option<bool>,
}

impl OtaApplyRequest {
    pub fn expected_sha256(&self) -> Option<String> {
        self.sha256
            .as_ref()
            .map(|value| value.trim().to_ascii_lowercase())
    }

    pub fn reboot_after_apply(&self) -> bool {
        self.reboot.unwrap_or(true)
    }

    /// An empty stored password disables the check.
    pub fn password_matches(&self, stored: &str) -> bool {
        stored.is_empty() || self.password.as_deref().unwrap_or_default() == stored
    }
}

pub fn validate_ota_apply_request(request: &OtaApplyRequest) -> Result<(), &'static str> {
    let url = request.url.trim();
    if url.is_empty() {
        return Err("url cannot be empty");
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err("url must start with http:// or https://");
    }

    if let Some(sha256) = request.sha256.as_ref() {
        let value = sha256.trim();
        if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err("sha256 must be 64 hex characters");
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct OtaApplyResponse {
    pub accepted: bool,
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtaStatusResponse {
    pub supported: bool,
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
    #[serde(rename = "bytesWritten")]
    pub bytes_written: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: Option<u64>,
    #[serde(rename = "progressPct")]
    pub progress_pct: Option<u8>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastSha256")]
    pub last_sha256: Option<String>,
    #[serde(rename = "lastSourceUrl")]
    pub last_source_url: Option<String>,
    #[serde(rename = "lastCompletedEpoch")]
    pub last_completed_epoch: Option<i64>,
    #[serde(rename = "runningSlot")]
    pub running_slot: Option<String>,
}

impl OtaStatusResponse {
    pub fn unsupported(reason: &str) -> Self {
        Self {
            supported: false,
            in_progress: false,
            bytes_written: 0,
            total_bytes: None,
            progress_pct: None,
            last_error: Some(reason.to_string()),
            last_sha256: None,
            last_source_url: None,
            last_completed_epoch: None,
            running_slot: None,
        }
    }
}

/// Bookkeeping for one firmware download at a time.
#[derive(Debug, Default)]
pub struct OtaProgress {
    in_progress: bool,
    bytes_written: u64,
    total_bytes: Option<u64>,
    last_error: Option<String>,
    last_sha256: Option<String>,
    last_source_url: Option<String>,
    last_completed_epoch: Option<i64>,
}

impl OtaProgress {
    /// Returns false if another update is already running.
    pub fn begin(&mut self, url: &str) -> bool {
        if self.in_progress {
            return false;
        }
        *self = Self {
            in_progress: true,
            last_source_url: Some(url.to_string()),
            last_completed_epoch: self.last_completed_epoch,
            ..Self::default()
        };
        true
    }

    pub fn set_total(&mut self, total_bytes: Option<u64>) {
        self.total_bytes = total_bytes.filter(|total| *total > 0);
    }

    pub fn record_written(&mut self, bytes_written: u64) {
        self.bytes_written = bytes_written;
    }

    pub fn progress_pct(&self) -> Option<u8> {
        let total = self.total_bytes?;
        Some((self.bytes_written.saturating_mul(100) / total).min(100) as u8)
    }

    pub fn finish(&mut self, digest_hex: String, epoch: i64) {
        self.in_progress = false;
        self.last_error = None;
        self.last_sha256 = Some(digest_hex);
        self.last_completed_epoch = Some(epoch);
        if self.total_bytes.is_none() {
            self.total_bytes = Some(self.bytes_written).filter(|total| *total > 0);
        }
    }

    pub fn fail(&mut self, error: String, epoch: i64) {
        self.in_progress = false;
        self.last_error = Some(error);
        self.last_completed_epoch = Some(epoch);
    }

    pub fn status(&self, running_slot: Option<String>) -> OtaStatusResponse {
        OtaStatusResponse {
            supported: true,
            in_progress: self.in_progress,
            bytes_written: self.bytes_written,
            total_bytes: self.total_bytes,
            progress_pct: self.progress_pct(),
            last_error: self.last_error.clone(),
            last_sha256: self.last_sha256.clone(),
            last_source_url: self.last_source_url.clone(),
            last_completed_epoch: self.last_completed_epoch,
            running_slot,
        }
    }
}

pub fn hex_digest(digest: &[u8]) -> String {
    use core::fmt::Write as _;

    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> OtaApplyRequest {
        OtaApplyRequest {
            url: url.to_string(),
            sha256: None,
            password: None,
            reboot: None,
        }
    }

    #[test]
    fn rejects_non_http_urls() {
        assert_eq!(
            validate_ota_apply_request(&request("")),
            Err("url cannot be empty")
        );
        assert_eq!(
            validate_ota_apply_request(&request("ftp://host/fw.bin")),
            Err("url must start with http:// or https://")
        );
        assert_eq!(
            validate_ota_apply_request(&request("https://host/fw.bin")),
            Ok(())
        );
    }

    #[test]
    fn sha256_must_be_hex() {
        let mut req = request("http://host/fw.bin");
        req.sha256 = Some("abc".to_string());
        assert_eq!(
            validate_ota_apply_request(&req),
            Err("sha256 must be 64 hex characters")
        );

        req.sha256 = Some(format!(" {} ", "AB".repeat(32)));
        assert_eq!(validate_ota_apply_request(&req), Ok(()));
        assert_eq!(req.expected_sha256(), Some("ab".repeat(32)));
    }

    #[test]
    fn password_check() {
        let mut req = request("http://host/fw.bin");
        assert!(req.password_matches(""));
        assert!(!req.password_matches("pool"));

        req.password = Some("pool".to_string());
        assert!(req.password_matches("pool"));
        assert!(req.reboot_after_apply());
    }

    #[test]
    fn progress_lifecycle() {
        let mut progress = OtaProgress::default();

        assert!(progress.begin("http://host/fw.bin"));
        assert!(!progress.begin("http://host/other.bin"));

        progress.set_total(Some(1_000));
        progress.record_written(250);
        assert_eq!(progress.progress_pct(), Some(25));

        progress.record_written(1_000);
        progress.finish("00ff".to_string(), 1_700_000_000);

        let status = progress.status(Some("ota_1".to_string()));
        assert!(!status.in_progress);
        assert_eq!(status.progress_pct, Some(100));
        assert_eq!(status.last_sha256.as_deref(), Some("00ff"));
        assert_eq!(status.last_source_url.as_deref(), Some("http://host/fw.bin"));

        assert!(progress.begin("http://host/next.bin"));
        assert_eq!(progress.status(None).last_completed_epoch, Some(1_700_000_000));
        assert_eq!(progress.status(None).bytes_written, 0);
    }

    #[test]
    fn failure_keeps_error() {
        let mut progress = OtaProgress::default();
        progress.begin("http://host/fw.bin");
        progress.fail("sha256 mismatch".to_string(), 42);

        let status = progress.status(None);
        assert!(!status.in_progress);
        assert_eq!(status.last_error.as_deref(), Some("sha256 mismatch"));
        assert_eq!(status.progress_pct, None);
    }

    #[test]
    fn digest_is_lowercase_hex() {
        assert_eq!(hex_digest(&[0x00, 0xab, 0xff]), "00abff");
    }
}
