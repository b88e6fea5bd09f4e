use std::{thread, time::Duration};

use anyhow::anyhow;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::Read,
};
use esp_idf_svc::{
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    ota::EspOta,
};
use log::{info, warn};
use sha2::{Digest, Sha256};

use pool_common::ota::{hex_digest, OtaApplyRequest, OtaApplyResponse, OtaStatusResponse};

use crate::esp::{schedule_restart, SharedState};

const OTA_CHUNK_SIZE: usize = 4096;

#[derive(Debug)]
pub enum OtaError {
    InvalidPassword,
    InProgress,
    Spawn(anyhow::Error),
}

/// Starts a background download of `request.url` into the inactive slot.
pub fn apply_ota_update(
    state: &SharedState,
    stored_password: &str,
    request: OtaApplyRequest,
) -> Result<OtaApplyResponse, OtaError> {
    if !request.password_matches(stored_password) {
        return Err(OtaError::InvalidPassword);
    }

    if !state.ota.lock().unwrap().begin(request.url.trim()) {
        return Err(OtaError::InProgress);
    }

    let worker_state = state.clone();
    let spawned = thread::Builder::new()
        .name("ota-apply".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            let url = request.url.trim().to_string();
            let expected_sha = request.expected_sha256();

            match download_and_apply(&worker_state, &url, expected_sha.as_deref()) {
                Ok((bytes_written, digest_hex)) => {
                    info!("OTA image from {url} applied ({bytes_written} bytes)");
                    worker_state
                        .ota
                        .lock()
                        .unwrap()
                        .finish(digest_hex, chrono::Utc::now().timestamp());

                    if request.reboot_after_apply() {
                        schedule_restart(Duration::from_millis(800));
                    }
                }
                Err(err) => {
                    warn!("OTA apply failed: {err:#}");
                    worker_state
                        .ota
                        .lock()
                        .unwrap()
                        .fail(err.to_string(), chrono::Utc::now().timestamp());
                }
            }
        });

    if let Err(err) = spawned {
        let message = format!("failed to spawn OTA apply thread: {err}");
        state
            .ota
            .lock()
            .unwrap()
            .fail(message.clone(), chrono::Utc::now().timestamp());
        return Err(OtaError::Spawn(anyhow!(message)));
    }

    Ok(OtaApplyResponse {
        accepted: true,
        in_progress: true,
    })
}

fn download_and_apply(
    state: &SharedState,
    url: &str,
    expected_sha256: Option<&str>,
) -> anyhow::Result<(u64, String)> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(30)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("OTA download failed with HTTP {status}"));
    }

    let content_length = response
        .header("content-length")
        .or_else(|| response.header("Content-Length"))
        .and_then(|value| value.parse::<u64>().ok());
    state.ota.lock().unwrap().set_total(content_length);

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut update = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

    let mut hasher = Sha256::new();
    let mut total_written = 0_u64;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];

    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }

        update
            .write(&chunk[..read])
            .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
        hasher.update(&chunk[..read]);
        total_written = total_written.saturating_add(read as u64);
        state.ota.lock().unwrap().record_written(total_written);
    }

    if total_written == 0 {
        return Err(anyhow!("OTA download body is empty"));
    }

    let digest_hex = hex_digest(&hasher.finalize());
    if let Some(expected) = expected_sha256 {
        if digest_hex != expected {
            return Err(anyhow!("sha256 mismatch (expected {expected}, got {digest_hex})"));
        }
    }

    update
        .complete()
        .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;

    Ok((total_written, digest_hex))
}

fn running_slot_label() -> Option<String> {
    let ota = EspOta::new().ok()?;
    let slot = ota.get_running_slot().ok()?;
    Some(slot.label.as_str().to_string())
}

pub fn build_ota_status_response(state: &SharedState) -> OtaStatusResponse {
    let running_slot = running_slot_label();
    state.ota.lock().unwrap().status(running_slot)
}
