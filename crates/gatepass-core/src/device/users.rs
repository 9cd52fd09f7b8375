//! Hotspot user management.
//!
//! Every operation opens its own channel and lets it drop when done;
//! nothing here is pooled or long-lived. Creation is strict about
//! preconditions (profile exists, identifier free) because it runs
//! before money moves; deletion is deliberately forgiving because it
//! runs as compensation, where throwing helps nobody.

use std::time::Duration;

use gatepass_routeros::{Channel, ChannelConfig, Command, DeviceEndpoint, ProfileRow, UserRow};

use crate::error::CoreError;
use crate::model::AccessCredential;

/// How many known profile names a ProfileNotFound error carries.
const PROFILE_SUGGESTIONS: usize = 3;

/// Options for [`create_user`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Skip the duplicate pre-check and the post-create read-back.
    /// For callers that prefer latency over a `verified` outcome.
    pub skip_verification: bool,
}

/// Timing knobs for user operations; tests shrink the delays.
#[derive(Debug, Clone)]
pub struct UserManagerConfig {
    pub channel: ChannelConfig,
    /// Pause before the second create read-back.
    pub verify_retry: Duration,
    /// Settle time before post-delete verification starts.
    pub delete_settle: Duration,
    /// Pause before the second post-delete check.
    pub delete_recheck: Duration,
}

impl Default for UserManagerConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            verify_retry: Duration::from_millis(800),
            delete_settle: Duration::from_secs(1),
            delete_recheck: Duration::from_millis(500),
        }
    }
}

/// Result of a successful create.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    /// Device record id, when the read-back observed the user.
    pub record_id: Option<String>,
    /// Whether the user was observed on the device after creation.
    pub verified: bool,
    /// Read-back attempt that saw it (0 = skipped or unobserved).
    pub attempt: u8,
}

/// Result of a delete. Deletion never errors; the caller decides how
/// loudly to log each case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    Failed,
}

/// Create a hotspot user for the credential.
///
/// Steps: validate the credential shape, check the profile exists
/// (listing a few known names on mismatch), check the identifier is
/// free unless `skip_verification`, add the user, then re-read the
/// user table up to twice. An add that never shows up in the read-back
/// still counts as created, with `verified: false`; transient table
/// lag must not fail a sale the device accepted.
pub async fn create_user(
    endpoint: &DeviceEndpoint,
    credential: &AccessCredential,
    profile_name: &str,
    options: &CreateOptions,
    config: &UserManagerConfig,
) -> Result<CreateOutcome, CoreError> {
    credential.validate()?;

    let mut channel = Channel::open(endpoint.clone(), config.channel.clone()).await?;

    let rows = channel
        .execute(&Command::new("/ip/hotspot/user/profile/print"))
        .await?;
    let profiles: Vec<String> = rows.iter().map(|r| ProfileRow::from_row(r).name).collect();
    if !profiles.iter().any(|name| name == profile_name) {
        return Err(CoreError::ProfileNotFound {
            requested: profile_name.to_owned(),
            available: profiles.into_iter().take(PROFILE_SUGGESTIONS).collect(),
        });
    }

    if !options.skip_verification {
        let rows = channel
            .execute(&Command::new("/ip/hotspot/user/print"))
            .await?;
        let taken = rows
            .iter()
            .map(UserRow::from_row)
            .any(|user| user.name == credential.identifier);
        if taken {
            return Err(CoreError::DuplicateUser {
                identifier: credential.identifier.clone(),
            });
        }
    }

    let add = Command::new("/ip/hotspot/user/add")
        .attr("name", &credential.identifier)
        .attr("profile", profile_name)
        .attr("disabled", "no")
        .attr_opt("password", credential.device_secret());
    if let Err(err) = channel.execute(&add).await {
        // Without the pre-check, collisions surface here as a trap.
        if err
            .trap_message()
            .is_some_and(|m| m.contains("already have user"))
        {
            return Err(CoreError::DuplicateUser {
                identifier: credential.identifier.clone(),
            });
        }
        return Err(err.into());
    }
    tracing::info!(
        user = %credential.identifier,
        profile = profile_name,
        "hotspot user created"
    );

    if options.skip_verification {
        channel.close().await;
        return Ok(CreateOutcome {
            record_id: None,
            verified: false,
            attempt: 0,
        });
    }

    let mut outcome = CreateOutcome {
        record_id: None,
        verified: false,
        attempt: 0,
    };
    for attempt in 1..=2u8 {
        if attempt > 1 {
            tokio::time::sleep(config.verify_retry).await;
        }
        let rows = channel
            .execute(&Command::new("/ip/hotspot/user/print"))
            .await?;
        let observed = rows
            .iter()
            .map(UserRow::from_row)
            .find(|user| user.name == credential.identifier);
        if let Some(user) = observed {
            if let Some(expected) = credential.device_secret() {
                if user.password.as_deref() != Some(expected) {
                    tracing::warn!(
                        user = %credential.identifier,
                        "stored password differs from generated secret"
                    );
                }
            }
            outcome = CreateOutcome {
                record_id: user.id,
                verified: true,
                attempt,
            };
            break;
        }
    }
    channel.close().await;

    if !outcome.verified {
        tracing::warn!(
            user = %credential.identifier,
            "created user not observed during read-back"
        );
    }
    Ok(outcome)
}

/// Delete a hotspot user by exact (trimmed, case-sensitive) name.
///
/// Best-effort: every failure mode logs and becomes a
/// [`DeleteOutcome`], never an error. Removal goes by numeric offset
/// first and falls back to the record id, matching what different
/// firmware builds accept.
pub async fn delete_user(
    endpoint: &DeviceEndpoint,
    identifier: &str,
    config: &UserManagerConfig,
) -> DeleteOutcome {
    match try_delete(endpoint, identifier, config).await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(user = identifier, error = %err, "user deletion failed");
            DeleteOutcome::Failed
        }
    }
}

async fn try_delete(
    endpoint: &DeviceEndpoint,
    identifier: &str,
    config: &UserManagerConfig,
) -> Result<DeleteOutcome, CoreError> {
    let wanted = identifier.trim();
    let mut channel = Channel::open(endpoint.clone(), config.channel.clone()).await?;

    let rows = channel
        .execute(&Command::new("/ip/hotspot/user/print"))
        .await?;
    let target = rows
        .iter()
        .map(UserRow::from_row)
        .find(|user| user.name.trim() == wanted);
    let Some(target) = target else {
        tracing::warn!(user = identifier, "delete requested for unknown user");
        return Ok(DeleteOutcome::NotFound);
    };
    let Some(record_id) = target.id else {
        tracing::warn!(user = identifier, "user row carries no record id");
        return Ok(DeleteOutcome::Failed);
    };

    let by_offset = Command::new("/ip/hotspot/user/remove").attr("numbers", &record_id);
    let removed = match channel.execute(&by_offset).await {
        Ok(_) => true,
        Err(offset_err) => {
            tracing::debug!(
                user = identifier,
                error = %offset_err,
                "offset removal refused, retrying by record id"
            );
            let by_id = Command::new("/ip/hotspot/user/remove").attr(".id", &record_id);
            match channel.execute(&by_id).await {
                Ok(_) => true,
                Err(id_err) => {
                    tracing::error!(
                        user = identifier,
                        error = %id_err,
                        "removal failed by offset and by record id"
                    );
                    false
                }
            }
        }
    };
    if !removed {
        return Ok(DeleteOutcome::Failed);
    }

    // Read-back is informational: the remove was accepted, so the
    // outcome stays Deleted even if the row lingers.
    tokio::time::sleep(config.delete_settle).await;
    for attempt in 1..=2u8 {
        let Ok(rows) = channel
            .execute(&Command::new("/ip/hotspot/user/print"))
            .await
        else {
            break;
        };
        let lingering = rows
            .iter()
            .map(UserRow::from_row)
            .any(|user| user.name.trim() == wanted);
        if !lingering {
            tracing::info!(user = identifier, attempt, "hotspot user deleted");
            break;
        }
        if attempt == 1 {
            tokio::time::sleep(config.delete_recheck).await;
        } else {
            tracing::warn!(user = identifier, "user still visible after removal");
        }
    }
    channel.close().await;
    Ok(DeleteOutcome::Deleted)
}
