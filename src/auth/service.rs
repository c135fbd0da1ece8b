use std::sync::Arc;

use axum::extract::FromRef;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::is_valid_email,
        error::AuthError,
        jwt::SessionKeys,
        otp,
        password::{hash_password, verify_password},
        repo::{CredentialStore, User},
    },
    notify::Notifier,
    state::AppState,
};

/// Orchestrates every credential and session flow. Sole caller of the
/// store, the hasher, the OTP generator and the token signer.
pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
    keys: SessionKeys,
}

impl FromRef<AppState> for AuthService {
    fn from_ref(state: &AppState) -> Self {
        Self::new(
            Arc::clone(&state.store),
            Arc::clone(&state.notifier),
            SessionKeys::from_ref(state),
        )
    }
}

impl AuthService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
        keys: SessionKeys,
    ) -> Self {
        Self {
            store,
            notifier,
            keys,
        }
    }

    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<(User, String), AuthError> {
        let name = name.trim();
        let email = email.trim().to_lowercase();
        if name.is_empty() || email.is_empty() || password.is_empty() {
            return Err(AuthError::Validation("Missing Details"));
        }
        if !is_valid_email(&email) {
            return Err(AuthError::Validation("Invalid email"));
        }

        if self.store.find_by_email(&email).await?.is_some() {
            warn!(email = %email, "registration with existing email");
            return Err(AuthError::Conflict);
        }

        let hash = hash_password(password)?;
        let user = self.store.insert(User::new(name, &email, hash)).await?;
        let token = self.keys.sign(user.id)?;

        info!(user_id = %user.id, email = %user.email, "user registered");
        self.dispatch(
            user.email.clone(),
            "Welcome to Our App",
            format!(
                "Hello,\n\nWelcome to our application! Your account has been created \
                 with email id: {}. We're excited to have you on board.\n\n\
                 Best regards,\nThe Team",
                user.email
            ),
        );
        Ok((user, token))
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<(User, String), AuthError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || password.is_empty() {
            return Err(AuthError::Validation("Missing Details"));
        }

        let user = self
            .store
            .find_by_email(&email)
            .await?
            .ok_or(AuthError::NotFound)?;

        if !verify_password(password, &user.password_hash)? {
            warn!(user_id = %user.id, "login with invalid password");
            return Err(AuthError::InvalidCredentials);
        }

        let token = self.keys.sign(user.id)?;
        info!(user_id = %user.id, email = %user.email, "user logged in");
        Ok((user, token))
    }

    pub async fn send_verify_otp(&self, user_id: Uuid) -> Result<(), AuthError> {
        let mut user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::NotFound)?;
        if user.is_account_verified {
            return Err(AuthError::AlreadyVerified);
        }

        // Overwrites any pending code; re-entry while unverified is allowed.
        let (code, expiry) = otp::generate();
        user.verify_otp = Some(code.clone());
        user.verify_otp_expiry = Some(expiry);
        self.store.save(&user).await?;

        info!(user_id = %user.id, "verification otp issued");
        self.dispatch(
            user.email,
            "Account Verification OTP",
            format!(
                "Hello,\n\nYour OTP for account verification is {code}. \
                 It is valid for 10 minutes.\n\nBest regards,\nThe Team"
            ),
        );
        Ok(())
    }

    pub async fn verify_email(&self, user_id: Uuid, otp: &str) -> Result<(), AuthError> {
        let otp = otp.trim();
        if otp.is_empty() {
            return Err(AuthError::Validation("Missing Details"));
        }

        let mut user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::NotFound)?;

        // A cleared code never matches, including against empty input.
        match user.verify_otp.as_deref() {
            Some(stored) if !stored.is_empty() && stored == otp => {}
            _ => return Err(AuthError::InvalidOtp),
        }
        // Expiry is checked lazily, only after the code matched.
        match user.verify_otp_expiry {
            Some(expiry) if OffsetDateTime::now_utc() <= expiry => {}
            _ => return Err(AuthError::OtpExpired),
        }

        user.is_account_verified = true;
        user.verify_otp = None;
        user.verify_otp_expiry = None;
        self.store.save(&user).await?;

        info!(user_id = %user.id, "email verified");
        Ok(())
    }

    pub async fn send_reset_otp(&self, email: &str) -> Result<(), AuthError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(AuthError::Validation("Email is required"));
        }

        let mut user = self
            .store
            .find_by_email(&email)
            .await?
            .ok_or(AuthError::NotFound)?;

        let (code, expiry) = otp::generate();
        user.reset_otp = Some(code.clone());
        user.reset_otp_expiry = Some(expiry);
        self.store.save(&user).await?;

        info!(user_id = %user.id, "reset otp issued");
        self.dispatch(
            user.email,
            "Password Reset OTP",
            format!(
                "Hello,\n\nYour OTP for password reset is {code}. Use this OTP for \
                 resetting your password. It is valid for 10 minutes.\n\n\
                 Best regards,\nThe Team"
            ),
        );
        Ok(())
    }

    pub async fn reset_password(
        &self,
        email: &str,
        otp: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let email = email.trim().to_lowercase();
        let otp = otp.trim();
        if email.is_empty() || otp.is_empty() || new_password.is_empty() {
            return Err(AuthError::Validation("Missing Details"));
        }

        let mut user = self
            .store
            .find_by_email(&email)
            .await?
            .ok_or(AuthError::NotFound)?;

        match user.reset_otp.as_deref() {
            Some(stored) if !stored.is_empty() && stored == otp => {}
            _ => return Err(AuthError::InvalidOtp),
        }
        match user.reset_otp_expiry {
            Some(expiry) if OffsetDateTime::now_utc() <= expiry => {}
            _ => return Err(AuthError::OtpExpired),
        }

        user.password_hash = hash_password(new_password)?;
        user.reset_otp = None;
        user.reset_otp_expiry = None;
        self.store.save(&user).await?;

        info!(user_id = %user.id, "password reset");
        Ok(())
    }

    // Delivery is detached from the flow's success path; a failure is
    // logged with the recipient and never aborts the operation.
    fn dispatch(&self, to: String, subject: &'static str, body: String) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.send(&to, subject, &body).await {
                error!(error = %e, to = %to, subject, "notification delivery failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::repo::{MemoryCredentialStore, StoreError},
        config::JwtConfig,
        notify::RecordingNotifier,
    };
    use std::time::Duration as StdDuration;
    use time::Duration;

    fn make_service() -> (AuthService, Arc<MemoryCredentialStore>, Arc<RecordingNotifier>) {
        let store = Arc::new(MemoryCredentialStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let keys = SessionKeys::from_config(&JwtConfig {
            secret: "test-secret".into(),
            issuer: "test".into(),
            audience: "test".into(),
            ttl_days: 7,
        });
        let service = AuthService::new(
            store.clone() as Arc<dyn CredentialStore>,
            notifier.clone() as Arc<dyn Notifier>,
            keys,
        );
        (service, store, notifier)
    }

    async fn registered(service: &AuthService) -> User {
        let (user, _) = service
            .register("Alice", "a@x.com", "pw123")
            .await
            .expect("register");
        user
    }

    async fn stored_user(store: &MemoryCredentialStore, email: &str) -> User {
        store
            .find_by_email(email)
            .await
            .expect("store")
            .expect("user present")
    }

    #[tokio::test]
    async fn register_then_login_resolves_same_user() {
        let (service, _, _) = make_service();
        let (user, token) = service
            .register("Alice", "a@x.com", "pw123")
            .await
            .expect("register");
        assert_eq!(service.keys.verify(&token).expect("verify").sub, user.id);
        assert!(!user.is_account_verified);

        let (logged_in, token) = service.login("a@x.com", "pw123").await.expect("login");
        assert_eq!(logged_in.id, user.id);
        assert_eq!(service.keys.verify(&token).expect("verify").sub, user.id);
    }

    #[tokio::test]
    async fn register_rejects_missing_fields() {
        let (service, _, _) = make_service();
        for (name, email, password) in
            [("", "a@x.com", "pw"), ("Alice", "", "pw"), ("Alice", "a@x.com", "")]
        {
            let err = service.register(name, email, password).await.unwrap_err();
            assert!(matches!(err, AuthError::Validation("Missing Details")));
        }
    }

    #[tokio::test]
    async fn register_rejects_malformed_email() {
        let (service, _, _) = make_service();
        let err = service.register("Alice", "nope", "pw123").await.unwrap_err();
        assert!(matches!(err, AuthError::Validation("Invalid email")));
    }

    #[tokio::test]
    async fn register_rejects_duplicate_email() {
        let (service, _, _) = make_service();
        registered(&service).await;
        let err = service
            .register("Alice Again", "a@x.com", "other")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict));
    }

    #[tokio::test]
    async fn register_sends_welcome_notification() {
        let (service, _, notifier) = make_service();
        registered(&service).await;
        // Delivery runs on a detached task.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@x.com");
        assert_eq!(sent[0].subject, "Welcome to Our App");
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let (service, _, _) = make_service();
        registered(&service).await;
        let err = service.login("a@x.com", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert_eq!(err.to_string(), "Invalid password");
        // No lockout: the outcome is the same on repeat.
        let err = service.login("a@x.com", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn login_rejects_unknown_email_and_missing_fields() {
        let (service, _, _) = make_service();
        let err = service.login("ghost@x.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::NotFound));
        let err = service.login("", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
        let err = service.login("a@x.com", "").await.unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }

    #[tokio::test]
    async fn send_verify_otp_issues_six_digit_code_with_window() {
        let (service, store, _) = make_service();
        let user = registered(&service).await;
        service.send_verify_otp(user.id).await.expect("send otp");

        let stored = stored_user(&store, "a@x.com").await;
        let code = stored.verify_otp.expect("otp present");
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        let value: u32 = code.parse().unwrap();
        assert!((100_000..=999_999).contains(&value));

        let expiry = stored.verify_otp_expiry.expect("expiry present");
        let now = OffsetDateTime::now_utc();
        assert!(expiry > now + Duration::minutes(9));
        assert!(expiry <= now + Duration::minutes(10));
    }

    #[tokio::test]
    async fn send_verify_otp_overwrites_pending_code() {
        let (service, store, _) = make_service();
        let user = registered(&service).await;

        // Plant a stale pending code that the generator could never emit.
        let mut planted = stored_user(&store, "a@x.com").await;
        planted.verify_otp = Some("pending".into());
        planted.verify_otp_expiry = Some(OffsetDateTime::now_utc() - Duration::minutes(5));
        store.save(&planted).await.expect("plant");

        service.send_verify_otp(user.id).await.expect("reissue");
        let stored = stored_user(&store, "a@x.com").await;
        let code = stored.verify_otp.expect("otp present");
        assert_ne!(code, "pending");
        assert_eq!(code.len(), 6);
        assert!(stored.verify_otp_expiry.expect("expiry") > OffsetDateTime::now_utc());
    }

    #[tokio::test]
    async fn service_builds_from_app_state() {
        let state = AppState::fake();
        let service = AuthService::from_ref(&state);
        service
            .register("Alice", "a@x.com", "pw123")
            .await
            .expect("register");
        service.login("a@x.com", "pw123").await.expect("login");
    }

    #[tokio::test]
    async fn send_verify_otp_unknown_user_fails_not_found() {
        let (service, _, _) = make_service();
        let err = service.send_verify_otp(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AuthError::NotFound));
    }

    #[tokio::test]
    async fn verify_email_happy_path_clears_otp_state() {
        let (service, store, _) = make_service();
        let user = registered(&service).await;
        service.send_verify_otp(user.id).await.expect("send otp");
        let code = stored_user(&store, "a@x.com").await.verify_otp.unwrap();

        service.verify_email(user.id, &code).await.expect("verify");

        let stored = stored_user(&store, "a@x.com").await;
        assert!(stored.is_account_verified);
        assert!(stored.verify_otp.is_none());
        assert!(stored.verify_otp_expiry.is_none());

        // Consumed code cannot be replayed.
        let err = service.verify_email(user.id, &code).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidOtp));
    }

    #[tokio::test]
    async fn verify_email_error_precedence() {
        let (service, store, _) = make_service();
        let user = registered(&service).await;

        // Missing input wins over everything else.
        let err = service.verify_email(Uuid::new_v4(), "").await.unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));

        // Unknown user beats invalid code.
        let err = service
            .verify_email(Uuid::new_v4(), "123456")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotFound));

        // No code issued yet: invalid code.
        let err = service.verify_email(user.id, "123456").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidOtp));

        // Issued but wrong code: still invalid, even if it would be expired.
        service.send_verify_otp(user.id).await.expect("send otp");
        let mut stored = stored_user(&store, "a@x.com").await;
        stored.verify_otp_expiry = Some(OffsetDateTime::now_utc() - Duration::minutes(1));
        let stored = store.save(&stored).await.expect("force expiry");
        let wrong = if stored.verify_otp.as_deref() == Some("000000") {
            "000001"
        } else {
            "000000"
        };
        let err = service.verify_email(user.id, wrong).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidOtp));

        // Right code past expiry: expired.
        let code = stored.verify_otp.unwrap();
        let err = service.verify_email(user.id, &code).await.unwrap_err();
        assert!(matches!(err, AuthError::OtpExpired));
    }

    #[tokio::test]
    async fn send_verify_otp_on_verified_account_is_rejected_untouched() {
        let (service, store, _) = make_service();
        let user = registered(&service).await;
        service.send_verify_otp(user.id).await.expect("send otp");
        let code = stored_user(&store, "a@x.com").await.verify_otp.unwrap();
        service.verify_email(user.id, &code).await.expect("verify");

        let err = service.send_verify_otp(user.id).await.unwrap_err();
        assert!(matches!(err, AuthError::AlreadyVerified));

        let stored = stored_user(&store, "a@x.com").await;
        assert!(stored.verify_otp.is_none());
        assert!(stored.verify_otp_expiry.is_none());
    }

    #[tokio::test]
    async fn reset_password_full_flow() {
        let (service, store, _) = make_service();
        registered(&service).await;

        service.send_reset_otp("a@x.com").await.expect("send reset");
        let code = stored_user(&store, "a@x.com").await.reset_otp.unwrap();

        service
            .reset_password("a@x.com", &code, "newpw")
            .await
            .expect("reset");

        let stored = stored_user(&store, "a@x.com").await;
        assert!(stored.reset_otp.is_none());
        assert!(stored.reset_otp_expiry.is_none());

        // Old password no longer works, new one does.
        let err = service.login("a@x.com", "pw123").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        service.login("a@x.com", "newpw").await.expect("login");

        // Consumed reset code cannot be replayed.
        let err = service
            .reset_password("a@x.com", &code, "again")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidOtp));
    }

    #[tokio::test]
    async fn reset_password_error_precedence() {
        let (service, store, _) = make_service();
        registered(&service).await;

        let err = service.reset_password("", "1", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
        let err = service
            .reset_password("a@x.com", "", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
        let err = service
            .reset_password("a@x.com", "000000", "")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));

        let err = service
            .reset_password("ghost@x.com", "000000", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotFound));

        // Deliberately wrong code.
        service.send_reset_otp("a@x.com").await.expect("send reset");
        let stored = stored_user(&store, "a@x.com").await;
        let wrong = if stored.reset_otp.as_deref() == Some("000000") {
            "000001"
        } else {
            "000000"
        };
        let err = service
            .reset_password("a@x.com", wrong, "newpw")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidOtp));
        assert_eq!(err.to_string(), "Invalid OTP");

        // Expired code.
        let mut stored = stored_user(&store, "a@x.com").await;
        stored.reset_otp_expiry = Some(OffsetDateTime::now_utc() - Duration::minutes(1));
        let stored = store.save(&stored).await.expect("force expiry");
        let code = stored.reset_otp.unwrap();
        let err = service
            .reset_password("a@x.com", &code, "newpw")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::OtpExpired));
    }

    #[tokio::test]
    async fn send_reset_otp_validation_and_not_found() {
        let (service, _, notifier) = make_service();
        let err = service.send_reset_otp("").await.unwrap_err();
        assert!(matches!(err, AuthError::Validation("Email is required")));
        let err = service.send_reset_otp("ghost@x.com").await.unwrap_err();
        assert!(matches!(err, AuthError::NotFound));

        registered(&service).await;
        service.send_reset_otp("a@x.com").await.expect("send reset");
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(notifier
            .sent()
            .iter()
            .any(|m| m.subject == "Password Reset OTP"));
    }

    #[tokio::test]
    async fn concurrent_otp_write_is_rejected_as_store_error() {
        let (service, store, _) = make_service();
        registered(&service).await;

        // Two flows read the same record; the slower write must not win.
        let snapshot = stored_user(&store, "a@x.com").await;
        let mut winner = snapshot.clone();
        winner.verify_otp = Some("111111".into());
        winner.verify_otp_expiry = Some(OffsetDateTime::now_utc() + Duration::minutes(10));
        store.save(&winner).await.expect("first write");

        let mut loser = snapshot;
        loser.reset_otp = Some("222222".into());
        let err = store.save(&loser).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleWrite));
        assert!(matches!(
            AuthError::from(StoreError::StaleWrite),
            AuthError::Store(_)
        ));
    }
}
