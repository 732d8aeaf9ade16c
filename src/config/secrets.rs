//! Environment-provided secrets
//!
//! The master secret, master salt and backup secret are never stored in
//! `config.json`. They are read once at startup; a missing or weak value is
//! a fatal configuration error.

use crate::crypto::key_derivation::MIN_SALT_LEN;
use crate::crypto::SecureString;
use crate::error::{FinguardError, FinguardResult};

pub const MASTER_SECRET_VAR: &str = "FINGUARD_MASTER_SECRET";
pub const MASTER_SALT_VAR: &str = "FINGUARD_MASTER_SALT";
pub const BACKUP_SECRET_VAR: &str = "FINGUARD_BACKUP_SECRET";

/// Minimum length of the master and backup secrets in bytes
pub const MIN_SECRET_LEN: usize = 16;

/// Root secrets for key derivation and key backups
#[derive(Debug, Clone)]
pub struct Secrets {
    master_secret: SecureString,
    master_salt: SecureString,
    backup_secret: SecureString,
}

impl Secrets {
    /// Validate a set of secrets
    pub fn new(
        master_secret: SecureString,
        master_salt: SecureString,
        backup_secret: SecureString,
    ) -> FinguardResult<Self> {
        check_len(MASTER_SECRET_VAR, &master_secret, MIN_SECRET_LEN)?;
        check_len(MASTER_SALT_VAR, &master_salt, MIN_SALT_LEN)?;
        check_len(BACKUP_SECRET_VAR, &backup_secret, MIN_SECRET_LEN)?;

        if master_secret.as_bytes() == backup_secret.as_bytes() {
            return Err(FinguardError::Config(format!(
                "{} must differ from {}",
                BACKUP_SECRET_VAR, MASTER_SECRET_VAR
            )));
        }

        Ok(Self {
            master_secret,
            master_salt,
            backup_secret,
        })
    }

    /// Read secrets from the process environment
    pub fn from_env() -> FinguardResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read secrets through an arbitrary lookup
    pub fn from_lookup<F>(lookup: F) -> FinguardResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(SecureString::new)
                .ok_or_else(|| FinguardError::Config(format!("{} is not set", name)))
        };

        Self::new(
            read(MASTER_SECRET_VAR)?,
            read(MASTER_SALT_VAR)?,
            read(BACKUP_SECRET_VAR)?,
        )
    }

    pub fn master_secret(&self) -> &SecureString {
        &self.master_secret
    }

    pub fn master_salt(&self) -> &SecureString {
        &self.master_salt
    }

    pub fn backup_secret(&self) -> &SecureString {
        &self.backup_secret
    }
}

fn check_len(name: &str, value: &SecureString, min: usize) -> FinguardResult<()> {
    if value.len() < min {
        return Err(FinguardError::Config(format!(
            "{} must be at least {} bytes",
            name, min
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    fn complete() -> Vec<(&'static str, &'static str)> {
        vec![
            (MASTER_SECRET_VAR, "master-secret-0123456789"),
            (MASTER_SALT_VAR, "salt-0001"),
            (BACKUP_SECRET_VAR, "backup-secret-0123456789"),
        ]
    }

    #[test]
    fn test_complete_environment() {
        let secrets = Secrets::from_lookup(lookup(&complete())).unwrap();
        assert_eq!(secrets.master_salt().as_str(), "salt-0001");
        assert_eq!(secrets.backup_secret().len(), 24);
    }

    #[test]
    fn test_missing_variable_is_config_error() {
        let vars: Vec<_> = complete()
            .into_iter()
            .filter(|(k, _)| *k != MASTER_SALT_VAR)
            .collect();
        let err = Secrets::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, FinguardError::Config(ref m) if m.contains(MASTER_SALT_VAR)));
    }

    #[test]
    fn test_weak_values_rejected() {
        let mut vars = complete();
        vars[0].1 = "short";
        assert!(Secrets::from_lookup(lookup(&vars)).is_err());

        let mut vars = complete();
        vars[1].1 = "salt";
        assert!(Secrets::from_lookup(lookup(&vars)).is_err());
    }

    #[test]
    fn test_backup_secret_must_differ() {
        let mut vars = complete();
        vars[2].1 = vars[0].1;
        assert!(Secrets::from_lookup(lookup(&vars)).is_err());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let secrets = Secrets::from_lookup(lookup(&complete())).unwrap();
        let debug = format!("{:?}", secrets);
        assert!(!debug.contains("master-secret"));
        assert!(!debug.contains("salt-0001"));
    }
}
