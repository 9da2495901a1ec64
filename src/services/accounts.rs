//! Customer accounts: registration, sessions, profile, one-time tokens,
//! address book and staff moderation.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::{normalize_phone, validate_phone, validate_zip};
use crate::domain::aggregates::customer::{check_password_strength, check_username};
use crate::domain::aggregates::{Address, AddressKind, CartOwner, Customer, Gender, Order, Preferences};
use crate::domain::events::{CustomerEvent, DomainEvent};
use crate::domain::value_objects::ZipCode;
use crate::publisher::EventPublisher;
use crate::store::{
    AccountToken, CustomerFlag, CustomerQuery, CustomerStats, OrderQuery, Page, PageRequest, Session, StoreError,
    StorefrontStore, TokenPurpose,
};
use crate::{Result, StorefrontError};

const RESET_TOKEN_TTL_HOURS: i64 = 1;
const EMAIL_TOKEN_TTL_HOURS: i64 = 24;
const RECENT_ORDERS: u32 = 5;

/// Argon2 is CPU-bound, so hashing runs on the blocking pool.
pub async fn hash_password(password: &str) -> Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| StorefrontError::Internal(format!("password hashing failed: {e}")))
    })
    .await
    .map_err(|e| StorefrontError::Internal(format!("password hashing task failed: {e}")))?
}

pub async fn verify_password(password: &str, hash: &str) -> bool {
    let (password, hash) = (password.to_string(), hash.to_string());
    let verified = tokio::task::spawn_blocking(move || {
        PasswordHash::new(&hash).is_ok_and(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
    })
    .await;
    verified.unwrap_or_else(|e| {
        warn!(error = %e, "password verification task failed");
        false
    })
}

/// Session and account tokens are handed out raw and stored only as their SHA-256.
pub fn token_hash(raw: &str) -> String { hex::encode(Sha256::digest(raw.as_bytes())) }

fn issue_token() -> (String, String) {
    let raw = hex::encode(rand::random::<[u8; 32]>());
    let hash = token_hash(&raw);
    (raw, hash)
}

fn confirm_password(password: &str, confirmation: &str) -> Result<()> {
    if password != confirmation {
        return Err(StorefrontError::Validation("Passwords do not match.".into()));
    }
    check_password_strength(password)?;
    Ok(())
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct Registration {
    #[validate(length(min = 1, max = 150))]
    pub username: String,
    #[validate(email)]
    pub email: String,
    #[serde(default)]
    #[validate(length(max = 150))]
    pub full_name: String,
    #[validate(custom = "validate_phone")]
    pub phone_number: Option<String>,
    pub password: String,
    pub password_confirm: String,
}

#[derive(Clone, Debug, Default, Deserialize, Validate)]
pub struct ProfileUpdate {
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(max = 150))]
    pub full_name: Option<String>,
    /// An empty string removes the number.
    #[validate(custom = "validate_phone")]
    pub phone_number: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<Gender>,
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AddressInput {
    #[serde(default)]
    pub kind: AddressKind,
    #[serde(default)]
    pub is_default: bool,
    #[validate(length(min = 1, max = 100))]
    pub recipient_name: String,
    #[validate(length(min = 1), custom = "validate_phone")]
    pub phone_number: String,
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    pub state: Option<String>,
    #[serde(default = "default_country")]
    pub country: String,
    #[validate(custom = "validate_zip")]
    pub zip_code: String,
    pub landmark: Option<String>,
    pub delivery_instructions: Option<String>,
}

fn default_country() -> String { "Bangladesh".to_string() }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction { Verify, Unverify, Activate, Deactivate }

impl ModerationAction {
    fn flag(self) -> (CustomerFlag, bool) {
        match self {
            Self::Verify => (CustomerFlag::Verified, true),
            Self::Unverify => (CustomerFlag::Verified, false),
            Self::Activate => (CustomerFlag::Active, true),
            Self::Deactivate => (CustomerFlag::Active, false),
        }
    }
}

/// A freshly opened session.
#[derive(Clone, Debug)]
pub struct SignedIn {
    pub customer: Customer,
    pub token: String,
}

/// The customer behind a bearer token.
#[derive(Clone, Debug)]
pub struct Authenticated {
    pub customer: Customer,
    pub token_hash: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProfileView {
    #[serde(flatten)]
    pub customer: Customer,
    pub display_name: String,
    pub has_complete_profile: bool,
    pub stats: CustomerStats,
    pub recent_orders: Vec<Order>,
}

#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn StorefrontStore>,
    events: EventPublisher,
    session_ttl: chrono::Duration,
}

impl AccountService {
    pub fn new(store: Arc<dyn StorefrontStore>, events: EventPublisher, session_ttl: chrono::Duration) -> Self {
        Self { store, events, session_ttl }
    }

    async fn load(&self, customer_id: Uuid) -> Result<Customer> {
        self.store.customer(customer_id).await?.ok_or(StorefrontError::NotFound("Customer"))
    }

    async fn open_session(&self, customer: Customer) -> Result<SignedIn> {
        let (token, hash) = issue_token();
        let now = Utc::now();
        self.store
            .insert_session(&Session { token_hash: hash, customer_id: customer.id, created_at: now, expires_at: now + self.session_ttl })
            .await?;
        Ok(SignedIn { customer, token })
    }

    async fn issue_account_token(&self, customer_id: Uuid, purpose: TokenPurpose, ttl_hours: i64) -> Result<String> {
        let (token, hash) = issue_token();
        self.store
            .insert_token(&AccountToken { token_hash: hash, customer_id, purpose, expires_at: Utc::now() + chrono::Duration::hours(ttl_hours) })
            .await?;
        Ok(token)
    }

    #[instrument(skip(self, input), fields(username = %input.username))]
    pub async fn register(&self, input: Registration, ip: Option<String>) -> Result<SignedIn> {
        check_username(&input.username)?;
        confirm_password(&input.password, &input.password_confirm)?;
        let phone = normalize_phone(input.phone_number.as_deref())?;

        let mut customer = Customer::register(input.username, input.email, input.full_name, phone, hash_password(&input.password).await?);
        customer.record_login(ip);
        self.store.insert_customer(&customer).await?;
        info!(customer_id = %customer.id, "customer registered");

        self.events
            .publish(&DomainEvent::Customer(CustomerEvent::Registered {
                customer_id: customer.id,
                email: customer.email.clone(),
                display_name: customer.display_name().to_string(),
            }))
            .await;
        self.open_session(customer).await
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, login: &str, password: &str, ip: Option<String>) -> Result<SignedIn> {
        let Some(mut customer) = self.store.customer_by_login(login.trim()).await? else {
            return Err(StorefrontError::InvalidCredentials);
        };
        if !verify_password(password, &customer.password_hash).await {
            warn!(customer_id = %customer.id, "failed login");
            return Err(StorefrontError::InvalidCredentials);
        }
        if !customer.is_active {
            return Err(StorefrontError::Forbidden("This account has been deactivated."));
        }
        customer.record_login(ip);
        self.store.update_customer(&customer).await?;
        info!(customer_id = %customer.id, "customer logged in");
        self.open_session(customer).await
    }

    /// Resolves a bearer token to an active customer.
    pub async fn authenticate(&self, token: &str) -> Result<Authenticated> {
        let hash = token_hash(token);
        let session = self.store.session(&hash).await?.ok_or(StorefrontError::Unauthorized)?;
        if session.expires_at <= Utc::now() {
            self.store.delete_session(&hash).await?;
            return Err(StorefrontError::Unauthorized);
        }
        match self.store.customer(session.customer_id).await? {
            Some(customer) if customer.is_active => Ok(Authenticated { customer, token_hash: hash }),
            _ => Err(StorefrontError::Unauthorized),
        }
    }

    pub async fn logout(&self, token_hash: &str) -> Result<()> {
        self.store.delete_session(token_hash).await?;
        Ok(())
    }

    pub async fn profile(&self, customer_id: Uuid) -> Result<ProfileView> {
        let customer = self.load(customer_id).await?;
        let stats = self.store.customer_stats(customer_id).await?;
        let recent = self
            .store
            .list_orders(&OrderQuery { customer_id: Some(customer_id), status: None, page: PageRequest::new(Some(1), Some(RECENT_ORDERS)) })
            .await?;
        Ok(ProfileView {
            display_name: customer.display_name().to_string(),
            has_complete_profile: customer.has_complete_profile(),
            customer,
            stats,
            recent_orders: recent.items,
        })
    }

    #[instrument(skip(self, update))]
    pub async fn update_profile(&self, customer_id: Uuid, update: ProfileUpdate) -> Result<Customer> {
        let mut customer = self.load(customer_id).await?;
        if let Some(email) = update.email {
            customer.change_email(&email);
        }
        if let Some(full_name) = update.full_name {
            customer.full_name = full_name.trim().to_string();
        }
        if let Some(phone) = update.phone_number {
            customer.change_phone(normalize_phone(Some(&phone))?);
        }
        if update.date_of_birth.is_some() {
            customer.date_of_birth = update.date_of_birth;
        }
        if update.gender.is_some() {
            customer.gender = update.gender;
        }
        customer.touch();
        self.store.update_customer(&customer).await?;
        Ok(customer)
    }

    /// Changes the password and signs out every other session.
    #[instrument(skip_all, fields(%customer_id))]
    pub async fn change_password(&self, customer_id: Uuid, keep_session: &str, current: &str, new: &str, confirmation: &str) -> Result<()> {
        let mut customer = self.load(customer_id).await?;
        if !verify_password(current, &customer.password_hash).await {
            return Err(StorefrontError::Validation("Your current password is incorrect.".into()));
        }
        confirm_password(new, confirmation)?;
        customer.password_hash = hash_password(new).await?;
        customer.touch();
        self.store.update_customer(&customer).await?;
        self.store.delete_sessions_except(customer_id, Some(keep_session)).await?;
        info!("password changed");
        Ok(())
    }

    pub async fn settings(&self, customer_id: Uuid) -> Result<Preferences> {
        Ok(self.load(customer_id).await?.preferences)
    }

    pub async fn update_settings(&self, customer_id: Uuid, preferences: Preferences) -> Result<Preferences> {
        let mut customer = self.load(customer_id).await?;
        customer.preferences = preferences;
        customer.touch();
        self.store.update_customer(&customer).await?;
        Ok(customer.preferences)
    }

    /// Never reveals whether the address belongs to an account.
    #[instrument(skip_all)]
    pub async fn forgot_password(&self, email: &str) -> Result<()> {
        let email = email.trim().to_lowercase();
        let customer = match self.store.customer_by_login(&email).await? {
            Some(c) if c.email == email && c.is_active => c,
            _ => return Ok(()),
        };
        let token = self.issue_account_token(customer.id, TokenPurpose::PasswordReset, RESET_TOKEN_TTL_HOURS).await?;
        info!(customer_id = %customer.id, "password reset requested");
        self.events
            .publish(&DomainEvent::Customer(CustomerEvent::PasswordResetRequested { customer_id: customer.id, email: customer.email, token }))
            .await;
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn reset_password(&self, token: &str, new: &str, confirmation: &str) -> Result<()> {
        confirm_password(new, confirmation)?;
        let customer_id = self
            .store
            .consume_token(&token_hash(token), TokenPurpose::PasswordReset, Utc::now())
            .await?
            .ok_or_else(|| StorefrontError::Validation("This reset link is invalid or has expired.".into()))?;
        let mut customer = self.load(customer_id).await?;
        customer.password_hash = hash_password(new).await?;
        customer.touch();
        self.store.update_customer(&customer).await?;
        self.store.delete_sessions_except(customer_id, None).await?;
        info!(%customer_id, "password reset");
        Ok(())
    }

    pub async fn request_email_verification(&self, customer_id: Uuid) -> Result<()> {
        let customer = self.load(customer_id).await?;
        if customer.email_verified {
            return Err(crate::domain::aggregates::AccountError::AlreadyVerified("email").into());
        }
        let token = self.issue_account_token(customer_id, TokenPurpose::EmailVerification, EMAIL_TOKEN_TTL_HOURS).await?;
        self.events
            .publish(&DomainEvent::Customer(CustomerEvent::EmailVerificationRequested { customer_id, email: customer.email, token }))
            .await;
        Ok(())
    }

    pub async fn confirm_email(&self, token: &str) -> Result<Customer> {
        let customer_id = self
            .store
            .consume_token(&token_hash(token), TokenPurpose::EmailVerification, Utc::now())
            .await?
            .ok_or_else(|| StorefrontError::Validation("This verification link is invalid or has expired.".into()))?;
        let mut customer = self.load(customer_id).await?;
        customer.verify_email()?;
        self.store.update_customer(&customer).await?;
        Ok(customer)
    }

    pub async fn verify_phone(&self, customer_id: Uuid) -> Result<Customer> {
        let mut customer = self.load(customer_id).await?;
        customer.verify_phone()?;
        self.store.update_customer(&customer).await?;
        Ok(customer)
    }

    /// Orders stay on record with the customer reference cleared.
    #[instrument(skip(self, password))]
    pub async fn delete_account(&self, customer_id: Uuid, password: &str) -> Result<()> {
        let customer = self.load(customer_id).await?;
        if !verify_password(password, &customer.password_hash).await {
            return Err(StorefrontError::Validation("Password is incorrect.".into()));
        }
        self.store.delete_cart(&CartOwner::Customer(customer_id)).await?;
        self.store.delete_customer(customer_id).await?;
        info!("account deleted");
        Ok(())
    }

    // --- address book ---

    pub async fn addresses(&self, customer_id: Uuid) -> Result<Vec<Address>> {
        Ok(self.store.addresses(customer_id).await?)
    }

    pub async fn address(&self, customer_id: Uuid, id: Uuid) -> Result<Address> {
        self.store.address(customer_id, id).await?.ok_or(StorefrontError::NotFound("Address"))
    }

    #[instrument(skip(self, input))]
    pub async fn add_address(&self, customer_id: Uuid, input: AddressInput) -> Result<Address> {
        let now = Utc::now();
        let address = Address {
            id: Uuid::now_v7(),
            customer_id,
            kind: input.kind,
            is_default: input.is_default,
            recipient_name: input.recipient_name.trim().to_string(),
            phone_number: String::new(),
            line1: input.line1.trim().to_string(),
            line2: input.line2,
            city: input.city.trim().to_string(),
            state: input.state,
            country: input.country.trim().to_string(),
            zip_code: String::new(),
            landmark: input.landmark,
            delivery_instructions: input.delivery_instructions,
            created_at: now,
            updated_at: now,
        };
        let address = with_contact(address, &input.phone_number, &input.zip_code)?;
        Ok(self.store.insert_address(&address).await?)
    }

    pub async fn update_address(&self, customer_id: Uuid, id: Uuid, input: AddressInput) -> Result<Address> {
        let mut address = self.address(customer_id, id).await?;
        address.kind = input.kind;
        address.recipient_name = input.recipient_name.trim().to_string();
        address.line1 = input.line1.trim().to_string();
        address.line2 = input.line2;
        address.city = input.city.trim().to_string();
        address.state = input.state;
        address.country = input.country.trim().to_string();
        address.landmark = input.landmark;
        address.delivery_instructions = input.delivery_instructions;
        address.updated_at = Utc::now();
        let address = with_contact(address, &input.phone_number, &input.zip_code)?;
        self.store.update_address(&address).await?;
        if input.is_default && !address.is_default {
            self.store.set_default_address(customer_id, id).await?;
        }
        self.address(customer_id, id).await
    }

    pub async fn delete_address(&self, customer_id: Uuid, id: Uuid) -> Result<()> {
        self.store.delete_address(customer_id, id).await.map_err(address_not_found)
    }

    pub async fn set_default_address(&self, customer_id: Uuid, id: Uuid) -> Result<Address> {
        self.store.set_default_address(customer_id, id).await.map_err(address_not_found)?;
        self.address(customer_id, id).await
    }

    // --- staff ---

    pub async fn list_customers(&self, query: &CustomerQuery) -> Result<Page<Customer>> {
        Ok(self.store.list_customers(query).await?)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn moderate(&self, ids: &[Uuid], action: ModerationAction) -> Result<u64> {
        let (flag, value) = action.flag();
        let updated = self.store.set_customer_flag(ids, flag, value).await?;
        if matches!(action, ModerationAction::Deactivate) {
            for id in ids {
                self.store.delete_sessions_except(*id, None).await?;
            }
        }
        info!(?action, updated, "customers moderated");
        Ok(updated)
    }
}

fn with_contact(mut address: Address, phone: &str, zip: &str) -> Result<Address> {
    address.phone_number = normalize_phone(Some(phone))?
        .ok_or_else(|| StorefrontError::Validation("A phone number is required.".into()))?;
    address.zip_code = ZipCode::parse(zip)?.as_str().to_string();
    Ok(address)
}

fn address_not_found(err: StoreError) -> StorefrontError {
    match err {
        StoreError::NotFound => StorefrontError::NotFound("Address"),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> (Arc<MemoryStore>, AccountService) {
        let store = Arc::new(MemoryStore::new());
        let service = AccountService::new(store.clone(), EventPublisher::disabled(), chrono::Duration::hours(1));
        (store, service)
    }

    fn registration(username: &str, email: &str) -> Registration {
        Registration {
            username: username.into(),
            email: email.into(),
            full_name: "Nadia Islam".into(),
            phone_number: None,
            password: "kurta2024".into(),
            password_confirm: "kurta2024".into(),
        }
    }

    fn home(is_default: bool) -> AddressInput {
        AddressInput {
            kind: AddressKind::Home,
            is_default,
            recipient_name: "Nadia".into(),
            phone_number: "+880 1712-345678".into(),
            line1: "House 12, Road 5".into(),
            line2: None,
            city: "Dhaka".into(),
            state: None,
            country: "Bangladesh".into(),
            zip_code: "1207".into(),
            landmark: None,
            delivery_instructions: None,
        }
    }

    #[tokio::test]
    async fn password_hashes_verify() {
        let hash = hash_password("kurta2024").await.unwrap();
        assert!(verify_password("kurta2024", &hash).await);
        assert!(!verify_password("kurta2025", &hash).await);
        assert!(!verify_password("kurta2024", "not-a-hash").await);
    }

    #[tokio::test]
    async fn register_then_login_by_email_or_username() {
        let (_, accounts) = service();
        let signed_in = accounts.register(registration("nadia", "Nadia@Example.com"), None).await.unwrap();
        let me = accounts.authenticate(&signed_in.token).await.unwrap();
        assert_eq!(me.customer.email, "nadia@example.com");

        accounts.login("NADIA@example.com", "kurta2024", Some("10.0.0.1".into())).await.unwrap();
        let again = accounts.login("nadia", "kurta2024", None).await.unwrap();
        assert_ne!(again.token, signed_in.token);
        assert!(matches!(accounts.login("nadia", "wrong1234", None).await, Err(StorefrontError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn registration_rules() {
        let (_, accounts) = service();
        let mut mismatch = registration("nadia", "n@example.com");
        mismatch.password_confirm = "other2024".into();
        assert!(matches!(accounts.register(mismatch, None).await, Err(StorefrontError::Validation(_))));

        let mut weak = registration("nadia", "n@example.com");
        weak.password = "password".into();
        weak.password_confirm = "password".into();
        assert!(accounts.register(weak, None).await.is_err());

        accounts.register(registration("nadia", "n@example.com"), None).await.unwrap();
        let dup = accounts.register(registration("other", "N@example.com"), None).await;
        assert!(matches!(dup, Err(StorefrontError::Store(StoreError::Duplicate("email")))));
    }

    #[tokio::test]
    async fn deactivated_customers_are_locked_out() {
        let (_, accounts) = service();
        let signed_in = accounts.register(registration("nadia", "n@example.com"), None).await.unwrap();
        accounts.moderate(&[signed_in.customer.id], ModerationAction::Deactivate).await.unwrap();
        assert!(matches!(accounts.authenticate(&signed_in.token).await, Err(StorefrontError::Unauthorized)));
        assert!(matches!(accounts.login("nadia", "kurta2024", None).await, Err(StorefrontError::Forbidden(_))));
    }

    #[tokio::test]
    async fn change_password_signs_out_other_sessions() {
        let (_, accounts) = service();
        let first = accounts.register(registration("nadia", "n@example.com"), None).await.unwrap();
        let second = accounts.login("nadia", "kurta2024", None).await.unwrap();
        let keep = token_hash(&first.token);

        accounts.change_password(first.customer.id, &keep, "kurta2024", "saree2025", "saree2025").await.unwrap();
        assert!(accounts.authenticate(&first.token).await.is_ok());
        assert!(accounts.authenticate(&second.token).await.is_err());
        assert!(accounts.login("nadia", "saree2025", None).await.is_ok());
    }

    #[tokio::test]
    async fn reset_token_is_single_use() {
        let (store, accounts) = service();
        let customer = accounts.register(registration("nadia", "n@example.com"), None).await.unwrap().customer;
        let (token, hash) = issue_token();
        store
            .insert_token(&AccountToken { token_hash: hash, customer_id: customer.id, purpose: TokenPurpose::PasswordReset, expires_at: Utc::now() + chrono::Duration::hours(1) })
            .await
            .unwrap();

        accounts.reset_password(&token, "lehenga99", "lehenga99").await.unwrap();
        assert!(accounts.login("nadia", "lehenga99", None).await.is_ok());
        assert!(matches!(accounts.reset_password(&token, "lehenga98", "lehenga98").await, Err(StorefrontError::Validation(_))));
    }

    #[tokio::test]
    async fn forgot_password_is_silent_for_unknown_email() {
        let (_, accounts) = service();
        accounts.forgot_password("nobody@example.com").await.unwrap();
        accounts.register(registration("nadia", "n@example.com"), None).await.unwrap();
        accounts.forgot_password("N@example.com").await.unwrap();
    }

    #[tokio::test]
    async fn email_confirmation_marks_verified_once() {
        let (store, accounts) = service();
        let customer = accounts.register(registration("nadia", "n@example.com"), None).await.unwrap().customer;
        let (token, hash) = issue_token();
        store
            .insert_token(&AccountToken { token_hash: hash, customer_id: customer.id, purpose: TokenPurpose::EmailVerification, expires_at: Utc::now() + chrono::Duration::hours(24) })
            .await
            .unwrap();
        assert!(accounts.confirm_email(&token).await.unwrap().email_verified);
        assert!(matches!(accounts.request_email_verification(customer.id).await, Err(StorefrontError::Account(_))));
    }

    #[tokio::test]
    async fn profile_update_resets_phone_verification() {
        let (_, accounts) = service();
        let mut input = registration("nadia", "n@example.com");
        input.phone_number = Some("+8801712345678".into());
        let customer = accounts.register(input, None).await.unwrap().customer;
        assert!(accounts.verify_phone(customer.id).await.unwrap().phone_verified);

        let update = ProfileUpdate { phone_number: Some("+8801812345678".into()), ..Default::default() };
        let updated = accounts.update_profile(customer.id, update).await.unwrap();
        assert!(!updated.phone_verified);
        assert_eq!(accounts.profile(customer.id).await.unwrap().display_name, "Nadia Islam");
    }

    #[tokio::test]
    async fn address_book_default_handling() {
        let (_, accounts) = service();
        let customer = Uuid::now_v7();
        let first = accounts.add_address(customer, home(false)).await.unwrap();
        assert!(first.is_default);
        assert_eq!(first.phone_number, "+8801712345678");

        let second = accounts.add_address(customer, home(true)).await.unwrap();
        let defaults: Vec<_> = accounts.addresses(customer).await.unwrap().into_iter().filter(|a| a.is_default).map(|a| a.id).collect();
        assert_eq!(defaults, vec![second.id]);

        accounts.delete_address(customer, second.id).await.unwrap();
        assert!(accounts.address(customer, first.id).await.unwrap().is_default);

        let stranger = Uuid::now_v7();
        assert!(matches!(accounts.set_default_address(stranger, first.id).await, Err(StorefrontError::NotFound("Address"))));
    }

    #[tokio::test]
    async fn delete_account_requires_password() {
        let (store, accounts) = service();
        let customer = accounts.register(registration("nadia", "n@example.com"), None).await.unwrap().customer;
        assert!(accounts.delete_account(customer.id, "wrong").await.is_err());
        accounts.delete_account(customer.id, "kurta2024").await.unwrap();
        assert!(store.customer(customer.id).await.unwrap().is_none());
    }
}
