//! Customer accounts and address book

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::order::ShippingAddress;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender { Male, Female, Other }

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self { Self::Male => "male", Self::Female => "female", Self::Other => "other" }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s { "male" => Some(Self::Male), "female" => Some(Self::Female), "other" => Some(Self::Other), _ => None }
    }
}

/// Notification preferences.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub newsletter: bool,
    pub marketing_emails: bool,
    pub sms_notifications: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub phone_number: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<Gender>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub preferences: Preferences,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub is_verified: bool,
    pub is_active: bool,
    pub is_staff: bool,
    pub last_login_ip: Option<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    pub fn register(username: impl Into<String>, email: impl Into<String>, full_name: impl Into<String>, phone_number: Option<String>, password_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(), username: username.into(), email: email.into().trim().to_lowercase(),
            full_name: full_name.into().trim().to_string(), phone_number, date_of_birth: None, gender: None,
            password_hash, preferences: Preferences::default(), email_verified: false, phone_verified: false,
            is_verified: false, is_active: true, is_staff: false, last_login_ip: None, last_login_at: None,
            created_at: now, updated_at: now,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.full_name.trim().is_empty() { &self.username } else { &self.full_name }
    }

    pub fn has_complete_profile(&self) -> bool {
        !self.full_name.trim().is_empty() && self.phone_number.is_some() && self.date_of_birth.is_some()
    }

    pub fn record_login(&mut self, ip: Option<String>) {
        self.last_login_ip = ip;
        self.last_login_at = Some(Utc::now());
        self.touch();
    }

    pub fn change_phone(&mut self, phone: Option<String>) {
        if phone != self.phone_number {
            self.phone_verified = false;
        }
        self.phone_number = phone;
        self.touch();
    }

    pub fn change_email(&mut self, email: &str) {
        let email = email.trim().to_lowercase();
        if email != self.email {
            self.email_verified = false;
            self.email = email;
        }
        self.touch();
    }

    pub fn verify_email(&mut self) -> Result<(), AccountError> {
        if self.email_verified { return Err(AccountError::AlreadyVerified("email")); }
        self.email_verified = true;
        self.touch();
        Ok(())
    }

    pub fn verify_phone(&mut self) -> Result<(), AccountError> {
        if self.phone_number.is_none() { return Err(AccountError::PhoneMissing); }
        if self.phone_verified { return Err(AccountError::AlreadyVerified("phone number")); }
        self.phone_verified = true;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) { self.updated_at = Utc::now(); }
}

/// Password rule shared by registration, change and reset.
pub fn check_password_strength(password: &str) -> Result<(), AccountError> {
    if password.chars().count() < 8 { return Err(AccountError::WeakPassword("Password must be at least 8 characters long.")); }
    if !password.chars().any(char::is_alphabetic) || !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(AccountError::WeakPassword("Password must contain both letters and numbers."));
    }
    Ok(())
}

/// Username characters: letters, digits and `@ . + - _`, at most 150.
pub fn check_username(username: &str) -> Result<(), AccountError> {
    let valid_chars = username.chars().all(|c| c.is_alphanumeric() || matches!(c, '@' | '.' | '+' | '-' | '_'));
    if username.is_empty() || username.chars().count() > 150 || !valid_chars {
        return Err(AccountError::InvalidUsername);
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind { #[default] Home, Office, Other }

impl AddressKind {
    pub fn as_str(self) -> &'static str {
        match self { Self::Home => "home", Self::Office => "office", Self::Other => "other" }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s { "home" => Some(Self::Home), "office" => Some(Self::Office), "other" => Some(Self::Other), _ => None }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub kind: AddressKind,
    pub is_default: bool,
    pub recipient_name: String,
    pub phone_number: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub state: Option<String>,
    pub country: String,
    pub zip_code: String,
    pub landmark: Option<String>,
    pub delivery_instructions: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Address {
    pub fn to_shipping(&self) -> ShippingAddress {
        ShippingAddress {
            recipient_name: self.recipient_name.clone(),
            phone_number: self.phone_number.clone(),
            line1: self.line1.clone(),
            line2: self.line2.clone(),
            city: self.city.clone(),
            state: self.state.clone(),
            zip_code: self.zip_code.clone(),
            country: self.country.clone(),
            delivery_instructions: self.delivery_instructions.clone(),
        }
    }
}

/// Address that inherits the default flag when `removed` goes away: the newest remaining one.
pub fn default_successor<'a>(addresses: impl IntoIterator<Item = &'a Address>, removed: Uuid) -> Option<Uuid> {
    addresses
        .into_iter()
        .filter(|a| a.id != removed)
        .max_by_key(|a| (a.created_at, a.id))
        .map(|a| a.id)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountError {
    #[error("{0}")]
    WeakPassword(&'static str),
    #[error("Usernames may contain up to 150 letters, digits and @/./+/-/_ only.")]
    InvalidUsername,
    #[error("Your {0} is already verified.")]
    AlreadyVerified(&'static str),
    #[error("Please add a phone number first.")]
    PhoneMissing,
}
