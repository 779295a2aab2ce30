//! Credential validation
//!
//! Checks a candidate password against an identity's stored credential and
//! enforces one-time-password semantics: a consumed one-time password fails
//! before any hash comparison, and the consumed flag is written with a
//! compare-and-swap so concurrent attempts cannot both succeed.

use tracing::{debug, warn};

use crate::auth::password::verify_password;
use crate::store::Store;
use crate::types::{Result, WardenError};

/// Validate a password for an identity.
///
/// Returns whether the accepted password was a one-time password, so the
/// caller can require the user to set a permanent one. Every failure mode
/// must surface to the end user as a single generic authentication error;
/// the distinct variants exist for internal logging.
pub fn validate_credential(store: &Store, identity_id: &str, password: &str) -> Result<bool> {
    let credential = store.get_credential_by_identity(identity_id)?;

    // Replay of a consumed one-time password fails before the hash is
    // touched, so response timing says nothing about whether the consumed
    // secret was correct.
    if credential.one_time_password && credential.one_time_password_used {
        warn!(identity_id = %identity_id, "Rejected reuse of a consumed one-time password");
        return Err(WardenError::OtpAlreadyUsed);
    }

    if !verify_password(password, &credential.password_hash)? {
        debug!(identity_id = %identity_id, "Password verification failed");
        return Err(WardenError::Auth("password verification failed".into()));
    }

    if credential.one_time_password {
        // Exactly one concurrent attempt may observe the unused flag. A
        // failed write must fail the login, otherwise the secret would
        // stay reusable.
        let consumed = store.consume_one_time_password(&credential.id)?;
        if !consumed {
            warn!(identity_id = %identity_id, "Lost one-time password consumption race");
            return Err(WardenError::OtpAlreadyUsed);
        }
        debug!(identity_id = %identity_id, "One-time password consumed");
    }

    Ok(credential.one_time_password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::hash_password;
    use crate::store::{Credential, Identity};

    fn store_with_credential(password: &str, one_time: bool) -> (Store, Identity) {
        let store = Store::open_in_memory().unwrap();
        let identity = Identity::new("admin");
        store.create_identity(&identity).unwrap();

        let hash = hash_password(password).unwrap();
        let credential = Credential::new(&identity.id, hash, one_time);
        store.create_credential(&credential).unwrap();
        (store, identity)
    }

    #[test]
    fn test_regular_password_validates_repeatedly() {
        let (store, identity) = store_with_credential("hunter2", false);

        for _ in 0..3 {
            let was_otp = validate_credential(&store, &identity.id, "hunter2").unwrap();
            assert!(!was_otp);
        }
    }

    #[test]
    fn test_wrong_password_fails() {
        let (store, identity) = store_with_credential("hunter2", false);
        let result = validate_credential(&store, &identity.id, "*******");
        assert!(matches!(result, Err(WardenError::Auth(_))));
    }

    #[test]
    fn test_missing_credential_fails() {
        let store = Store::open_in_memory().unwrap();
        let result = validate_credential(&store, "no-such-identity", "hunter2");
        assert!(matches!(result, Err(WardenError::NotFound(_))));
    }

    #[test]
    fn test_one_time_password_single_use() {
        let (store, identity) = store_with_credential("hunter2", true);

        let was_otp = validate_credential(&store, &identity.id, "hunter2").unwrap();
        assert!(was_otp);

        // The same correct password is now rejected
        let result = validate_credential(&store, &identity.id, "hunter2");
        assert!(matches!(result, Err(WardenError::OtpAlreadyUsed)));
    }

    #[test]
    fn test_consumed_otp_rejected_before_hash_comparison() {
        let (store, identity) = store_with_credential("hunter2", true);
        validate_credential(&store, &identity.id, "hunter2").unwrap();

        // Even a wrong password yields the replay error, not a hash failure
        let result = validate_credential(&store, &identity.id, "wrong");
        assert!(matches!(result, Err(WardenError::OtpAlreadyUsed)));
    }

    #[test]
    fn test_reset_makes_credential_usable_again() {
        let (store, identity) = store_with_credential("hunter2", true);
        validate_credential(&store, &identity.id, "hunter2").unwrap();

        let new_hash = hash_password("correct-horse").unwrap();
        store.reset_credential(&identity.id, &new_hash, false).unwrap();

        let was_otp = validate_credential(&store, &identity.id, "correct-horse").unwrap();
        assert!(!was_otp);
    }

    #[test]
    fn test_concurrent_consumers_single_winner() {
        let (store, identity) = store_with_credential("hunter2", true);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let identity_id = identity.id.clone();
            handles.push(std::thread::spawn(move || {
                validate_credential(&store, &identity_id, "hunter2").is_ok()
            }));
        }

        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1, "exactly one concurrent login may consume the OTP");
    }
}
