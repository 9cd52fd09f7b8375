//! Access credentials and the generator that mints them.

use rand::Rng;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::CoreError;

/// Credential shape sold with a product.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CredentialKind {
    /// A single six-digit PIN; the identifier is the whole credential.
    PinOnly,
    /// Six uppercase alphanumerics plus a four-digit secret.
    #[default]
    UserAndSecret,
}

impl CredentialKind {
    /// Total normalization of product catalog input. Unrecognized
    /// spellings fall back to [`CredentialKind::UserAndSecret`]; this
    /// never errors.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "pin" | "pin_only" | "pin-only" | "pinonly" => Self::PinOnly,
            _ => Self::UserAndSecret,
        }
    }
}

const IDENTIFIER_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const DIGITS: &[u8] = b"0123456789";

fn draw(rng: &mut impl Rng, charset: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| char::from(charset[rng.gen_range(0..charset.len())]))
        .collect()
}

/// A provisioned hotspot credential.
///
/// `secret` is empty exactly when `kind` is [`CredentialKind::PinOnly`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCredential {
    pub kind: CredentialKind,
    pub identifier: String,
    pub secret: String,
}

impl AccessCredential {
    /// Draw a fresh credential. Pure apart from the RNG: no I/O and no
    /// uniqueness registry. Collisions surface later as duplicate-user
    /// errors from the device.
    pub fn generate(kind: CredentialKind) -> Self {
        let mut rng = rand::thread_rng();
        match kind {
            CredentialKind::PinOnly => Self {
                kind,
                identifier: draw(&mut rng, DIGITS, 6),
                secret: String::new(),
            },
            CredentialKind::UserAndSecret => Self {
                kind,
                identifier: draw(&mut rng, IDENTIFIER_CHARSET, 6),
                secret: draw(&mut rng, DIGITS, 4),
            },
        }
    }

    /// Enforce the shape rules for the kind.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self.kind {
            CredentialKind::PinOnly => {
                if self.identifier.len() != 6
                    || !self.identifier.bytes().all(|b| b.is_ascii_digit())
                {
                    return Err(CoreError::Validation {
                        field: "identifier",
                        reason: "PIN must be exactly 6 digits".to_owned(),
                    });
                }
                if !self.secret.is_empty() {
                    return Err(CoreError::Validation {
                        field: "secret",
                        reason: "PIN credentials carry no secret".to_owned(),
                    });
                }
            }
            CredentialKind::UserAndSecret => {
                if self.identifier.len() != 6
                    || !self
                        .identifier
                        .bytes()
                        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
                {
                    return Err(CoreError::Validation {
                        field: "identifier",
                        reason: "identifier must be 6 uppercase alphanumerics".to_owned(),
                    });
                }
                if self.secret.len() != 4 || !self.secret.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(CoreError::Validation {
                        field: "secret",
                        reason: "secret must be exactly 4 digits".to_owned(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The password to store on the device, when this kind carries one.
    /// PIN credentials authenticate by name alone; the attribute must
    /// be omitted entirely for them.
    pub fn device_secret(&self) -> Option<&str> {
        match self.kind {
            CredentialKind::PinOnly => None,
            CredentialKind::UserAndSecret => Some(&self.secret),
        }
    }

    /// Copy with identifier and secret blanked, for outcomes that must
    /// withhold credentials until settlement.
    pub fn redacted(&self) -> Self {
        Self {
            kind: self.kind,
            identifier: String::new(),
            secret: String::new(),
        }
    }
}
