//! Input validation for the ValidateInputs step

use std::collections::BTreeMap;

use crate::errors::ManagerError;
use crate::storage::ports::MIN_PORT;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;
const MAX_BRANCH_LEN: usize = 255;

/// Dot-separated labels of ASCII letters, digits and inner hyphens
pub fn validate_domain(domain: &str) -> Result<(), ManagerError> {
    let invalid = |why: &str| Err(ManagerError::ValidationError(format!("Invalid domain '{}': {}", domain, why)));

    if domain.is_empty() {
        return invalid("empty");
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return invalid("longer than 253 characters");
    }
    for label in domain.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return invalid("each label must be 1-63 characters");
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return invalid("only letters, digits, '-' and '.' are allowed");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return invalid("labels cannot start or end with '-'");
        }
    }
    Ok(())
}

pub fn validate_port(port: u16) -> Result<(), ManagerError> {
    if port < MIN_PORT {
        return Err(ManagerError::ValidationError(format!(
            "Invalid port {}: must be between {} and 65535",
            port, MIN_PORT
        )));
    }
    Ok(())
}

/// Git ref rules the manager enforces before passing a branch to a shell
pub fn validate_branch(branch: &str) -> Result<(), ManagerError> {
    let invalid = |why: &str| Err(ManagerError::ValidationError(format!("Invalid branch '{}': {}", branch, why)));

    if branch.is_empty() {
        return invalid("empty");
    }
    if branch.len() > MAX_BRANCH_LEN {
        return invalid("longer than 255 characters");
    }
    if branch.starts_with('.') {
        return invalid("cannot start with '.'");
    }
    if branch.starts_with('-') {
        return invalid("cannot start with '-'");
    }
    if branch.contains("..") {
        return invalid("cannot contain '..'");
    }
    if branch.chars().any(|c| "@{~^:\\".contains(c) || c.is_whitespace() || c.is_control()) {
        return invalid("contains a forbidden character");
    }
    if branch.chars().any(|c| "'\"`$;&|<>*?[()".contains(c)) {
        return invalid("contains a shell metacharacter");
    }
    Ok(())
}

/// Keys must match `[A-Z_][A-Z0-9_]*`
pub fn validate_env_key(key: &str) -> Result<(), ManagerError> {
    let mut chars = key.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_uppercase() || first == '_')
                && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        }
        None => false,
    };
    if !valid {
        return Err(ManagerError::ValidationError(format!(
            "Invalid environment variable name '{}': use uppercase letters, digits and '_'",
            key
        )));
    }
    Ok(())
}

pub fn validate_env(env: &BTreeMap<String, String>) -> Result<(), ManagerError> {
    for (key, value) in env {
        validate_env_key(key)?;
        if value.contains('\n') || value.contains('\0') {
            return Err(ManagerError::ValidationError(format!(
                "Environment variable {} contains a newline or NUL",
                key
            )));
        }
    }
    Ok(())
}

/// `local@domain`, with a domain `validate_domain` accepts
pub fn validate_email(email: &str) -> Result<(), ManagerError> {
    let invalid = |why: &str| Err(ManagerError::ValidationError(format!("Invalid email '{}': {}", email, why)));

    let Some((local, domain)) = email.split_once('@') else {
        return invalid("missing '@'");
    };
    if local.is_empty() || local.starts_with('-') {
        return invalid("empty or option-like local part");
    }
    if !local.chars().all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c)) {
        return invalid("unsupported character in the local part");
    }
    if !domain.contains('.') || validate_domain(domain).is_err() {
        return invalid("invalid domain");
    }
    Ok(())
}

/// Parse a `KEY=VALUE` pair as given on the command line
pub fn parse_env_pair(pair: &str) -> Result<(String, String), ManagerError> {
    let (key, value) = pair.split_once('=').ok_or_else(|| {
        ManagerError::ValidationError(format!("Invalid environment variable '{}': expected KEY=VALUE", pair))
    })?;
    let key = key.trim();
    validate_env_key(key)?;
    Ok((key.to_string(), value.trim().to_string()))
}
