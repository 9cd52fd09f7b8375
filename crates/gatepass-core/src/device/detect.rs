//! Firmware capability probe.

use std::time::Duration;

use gatepass_routeros::{Channel, ChannelConfig, Command, DeviceEndpoint, ResourceRow};

/// Firmware generations the binder distinguishes. The split follows
/// the captive-portal login surface, which changed shape in major 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareGeneration {
    Legacy,
    Modern,
}

impl FirmwareGeneration {
    pub fn from_major(major: u32) -> Self {
        if major >= 7 { Self::Modern } else { Self::Legacy }
    }
}

/// Assumed major version when the probe cannot tell.
pub const LEGACY_DEFAULT_MAJOR: u32 = 6;

const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Read the firmware major version from the resource table.
///
/// Every failure mode (unreachable, bad credentials, missing version
/// attribute, unparseable string) falls back to the legacy default:
/// callers always get an answer, never an error. Legacy handling works
/// on modern firmware, just with more round trips; the reverse does
/// not hold.
pub async fn detect_major(endpoint: &DeviceEndpoint) -> u32 {
    match probe(endpoint).await {
        Ok(major) => major,
        Err(err) => {
            tracing::warn!(
                host = %endpoint.host,
                error = %err,
                "capability probe failed, assuming legacy firmware"
            );
            LEGACY_DEFAULT_MAJOR
        }
    }
}

pub async fn detect_generation(endpoint: &DeviceEndpoint) -> FirmwareGeneration {
    FirmwareGeneration::from_major(detect_major(endpoint).await)
}

async fn probe(endpoint: &DeviceEndpoint) -> Result<u32, gatepass_routeros::Error> {
    let config = ChannelConfig {
        connect_timeout: PROBE_TIMEOUT,
        reconnect_attempts: 0,
        backoff_base: Duration::ZERO,
    };
    let mut channel = Channel::open(endpoint.clone(), config).await?;
    let rows = channel
        .execute(&Command::new("/system/resource/print"))
        .await?;
    channel.close().await;

    rows.first()
        .map(ResourceRow::from_row)
        .and_then(|resource| resource.major_version())
        .ok_or_else(|| {
            gatepass_routeros::Error::Protocol("no parsable version in resource table".to_owned())
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generation_splits_at_major_seven() {
        assert_eq!(FirmwareGeneration::from_major(6), FirmwareGeneration::Legacy);
        assert_eq!(FirmwareGeneration::from_major(7), FirmwareGeneration::Modern);
        assert_eq!(FirmwareGeneration::from_major(8), FirmwareGeneration::Modern);
        assert_eq!(
            FirmwareGeneration::from_major(LEGACY_DEFAULT_MAJOR),
            FirmwareGeneration::Legacy
        );
    }
}
