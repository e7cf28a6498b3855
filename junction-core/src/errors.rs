//! Process-wide registry of user-defined handled error codes.
//!
//! The original registers each `HandledError` subclass into a shared dict at
//! class-definition time, raising on a duplicate `code`. Rust has no
//! class-definition-time side effects to hook, so this is expressed as an
//! explicit builder installed before the hub starts; registration after
//! start is a programmer error.

use hashbrown::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorRegistryError {
    #[error("error code {0} is already registered to {1}")]
    DuplicateCode(i32, String),
}

/// Builder-style registry mapping an integer code to the name of the
/// user error kind it represents.
#[derive(Debug, Default, Clone)]
pub struct ErrorRegistry {
    by_code: HashMap<i32, String>,
}

impl ErrorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `code` for the error kind `name`. Errors unconditionally on
    /// any repeat `code`, even re-registering the same name — matching the
    /// original's unconditional raise on a duplicate code.
    pub fn register(&mut self, code: i32, name: impl Into<String>) -> Result<(), ErrorRegistryError> {
        let name = name.into();
        if let Some(existing) = self.by_code.get(&code) {
            return Err(ErrorRegistryError::DuplicateCode(code, existing.clone()));
        }
        self.by_code.insert(code, name);
        Ok(())
    }

    pub fn name_for(&self, code: i32) -> Option<&str> {
        self.by_code.get(&code).map(String::as_str)
    }

    pub fn contains(&self, code: i32) -> bool {
        self.by_code.contains_key(&code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_code_different_name_rejected() {
        let mut reg = ErrorRegistry::new();
        reg.register(3, "CustomError").unwrap();
        assert_eq!(
            reg.register(3, "OtherError"),
            Err(ErrorRegistryError::DuplicateCode(3, "CustomError".into()))
        );
    }

    #[test]
    fn same_code_same_name_still_rejected() {
        let mut reg = ErrorRegistry::new();
        reg.register(3, "CustomError").unwrap();
        assert_eq!(
            reg.register(3, "CustomError"),
            Err(ErrorRegistryError::DuplicateCode(3, "CustomError".into()))
        );
    }

    #[test]
    fn lookup_by_code() {
        let mut reg = ErrorRegistry::new();
        reg.register(5, "Gaah").unwrap();
        assert_eq!(reg.name_for(5), Some("Gaah"));
        assert_eq!(reg.name_for(6), None);
    }
}
