//! Key derivation.
//!
//! A key is the remainder of a hexadecimal identifier, read as an unsigned
//! arbitrary-precision integer, divided by a small fixed modulus. The store's
//! own aggregation operators cannot do this conversion (integer casts overflow
//! on 96-bit identifiers), which is why it happens client-side.

use num_bigint::BigUint;
use num_traits::ToPrimitive;

use crate::error::{PipelineError, Result};

/// Default modulus.
pub const DEFAULT_MODULUS: u32 = 43;

/// Derives bounded integer keys from hexadecimal strings.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    modulus: u32,
    divisor: BigUint,
}

impl KeyDeriver {
    /// Create a deriver producing keys in `[0, modulus)`.
    pub fn new(modulus: u32) -> Result<Self> {
        if modulus == 0 {
            return Err(PipelineError::Config("modulus must be greater than 0".to_string()));
        }
        Ok(Self {
            modulus,
            divisor: BigUint::from(modulus),
        })
    }

    pub fn modulus(&self) -> u32 {
        self.modulus
    }

    /// Parse `hex` as base-16 and reduce it modulo the configured modulus.
    ///
    /// Only ASCII hex digits are accepted: no sign, prefix, whitespace or
    /// digit separators.
    pub fn derive(&self, hex: &str) -> Result<u32> {
        if hex.is_empty() {
            return Err(PipelineError::malformed(hex, "empty input"));
        }
        if let Some(bad) = hex.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(PipelineError::malformed(
                hex,
                format!("invalid hex digit {:?}", bad),
            ));
        }

        let value = BigUint::parse_bytes(hex.as_bytes(), 16)
            .ok_or_else(|| PipelineError::malformed(hex, "not a base-16 integer"))?;

        (value % &self.divisor)
            .to_u32()
            .ok_or_else(|| PipelineError::Runtime("remainder exceeds modulus width".to_string()))
    }
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self {
            modulus: DEFAULT_MODULUS,
            divisor: BigUint::from(DEFAULT_MODULUS),
        }
    }
}
