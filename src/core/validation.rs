
use crate::core::constants::MAX_COLLECTION_NAME_LEN;
use crate::core::errors::*;

const RESERVED_COLLECTION_NAMES: &[&str] = &["_header", "_internal", "_system"];

/// Checks a collection name before it is written into the header catalog.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::CollectionNameEmpty);
    }

    if name.len() > MAX_COLLECTION_NAME_LEN {
        return Err(Error::CollectionNameTooLong);
    }

    let first_char = name.chars().next().ok_or(Error::CollectionNameEmpty)?;
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(Error::CollectionNameInvalidStart);
    }

    if name.chars().any(|ch| !ch.is_ascii_alphanumeric() && ch != '_') {
        return Err(Error::CollectionNameInvalidChar);
    }

    if RESERVED_COLLECTION_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
    {
        return Err(Error::CollectionNameReserved);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_collection_name("users").is_ok());
        assert!(validate_collection_name("_audit_log").is_ok());
        assert!(validate_collection_name("Orders2024").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(matches!(validate_collection_name(""), Err(Error::CollectionNameEmpty)));
        assert!(matches!(validate_collection_name("1users"), Err(Error::CollectionNameInvalidStart)));
        assert!(matches!(validate_collection_name("my-users"), Err(Error::CollectionNameInvalidChar)));
        assert!(matches!(validate_collection_name("my users"), Err(Error::CollectionNameInvalidChar)));
        assert!(matches!(validate_collection_name("_SYSTEM"), Err(Error::CollectionNameReserved)));

        let long_name = "a".repeat(MAX_COLLECTION_NAME_LEN + 1);
        assert!(matches!(validate_collection_name(&long_name), Err(Error::CollectionNameTooLong)));
    }
}
