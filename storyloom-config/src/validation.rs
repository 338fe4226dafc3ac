use crate::{ConfigError, Result};

/// Implemented by typed config structs to reject unusable values at load time.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Reusable field checks for [`Validate`] impls.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn not_empty(value: &str, field: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{} cannot be empty", field)));
        }
        Ok(())
    }

    pub fn in_range<T: PartialOrd + std::fmt::Display>(
        value: T,
        min: T,
        max: T,
        field: &str,
    ) -> Result<()> {
        if value < min || value > max {
            return Err(ConfigError::Validation(format!(
                "{} must be between {} and {}, got {}",
                field, min, max, value
            )));
        }
        Ok(())
    }

    pub fn positive(value: u64, field: &str) -> Result<()> {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{} must be greater than zero", field)));
        }
        Ok(())
    }

    /// `smaller` must be strictly below `larger`.
    pub fn less_than(smaller: u64, larger: u64, smaller_field: &str, larger_field: &str) -> Result<()> {
        if smaller >= larger {
            return Err(ConfigError::Validation(format!(
                "{} ({}) must be less than {} ({})",
                smaller_field, smaller, larger_field, larger
            )));
        }
        Ok(())
    }

    pub fn is_port(value: u16, field: &str) -> Result<()> {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{} must be a valid port number", field)));
        }
        Ok(())
    }
}
