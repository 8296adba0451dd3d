//! The authenticator seam. Front ends (FTP, HTTP) invoke this once per
//! session; the engine itself never verifies identity.

/// Authentication failure.
#[derive(Debug, thiserror::Error)]
#[error("authentication failed")]
pub struct AuthenticationFailed;

/// Checks plain credentials once per front-end session.
pub trait Authenticator: Send + Sync {
    /// Validate a user/password pair.
    ///
    /// # Errors
    ///
    /// Returns [`AuthenticationFailed`] on a mismatch.
    fn auth_password_plain(&self, user: &str, password: &str)
    -> Result<(), AuthenticationFailed>;
}

/// Single static credential pair.
pub struct StaticAuthenticator {
    user: String,
    password: String,
}

impl StaticAuthenticator {
    /// An authenticator accepting exactly this pair.
    #[must_use]
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for StaticAuthenticator {
    fn auth_password_plain(
        &self,
        user: &str,
        password: &str,
    ) -> Result<(), AuthenticationFailed> {
        if user == self.user && password == self.password {
            Ok(())
        } else {
            Err(AuthenticationFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials_match_exactly() {
        let auth = StaticAuthenticator::new("peervod", "s3cret");
        assert!(auth.auth_password_plain("peervod", "s3cret").is_ok());
        assert!(auth.auth_password_plain("peervod", "wrong").is_err());
        assert!(auth.auth_password_plain("other", "s3cret").is_err());
    }
}
