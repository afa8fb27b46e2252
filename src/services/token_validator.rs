use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use serde::Serialize;

use crate::db::models::PushToken;

/// Recognized push token families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenFormat {
    /// `ExpoPushToken[...]`
    Expo,
    /// Legacy `ExponentPushToken[...]`
    ExpoLegacy,
    /// Firebase Cloud Messaging registration token
    Fcm,
    /// FCM token issued to a web client (longer form)
    FcmWeb,
    /// Apple Push Notification service device token (64 hex chars)
    Apns,
}

impl TokenFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenFormat::Expo => "expo",
            TokenFormat::ExpoLegacy => "expo_legacy",
            TokenFormat::Fcm => "fcm",
            TokenFormat::FcmWeb => "fcm_web",
            TokenFormat::Apns => "apns",
        }
    }
}

/// Outcome of validating a raw token string. Validation is pure: the same
/// input always produces the same outcome, which is what makes the
/// process-lifetime cache below sound.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenValidation {
    pub is_valid: bool,
    pub format: Option<TokenFormat>,
    pub errors: Vec<String>,
}

impl TokenValidation {
    fn invalid(error: impl Into<String>) -> Self {
        TokenValidation {
            is_valid: false,
            format: None,
            errors: vec![error.into()],
        }
    }

    fn valid(format: TokenFormat) -> Self {
        TokenValidation {
            is_valid: true,
            format: Some(format),
            errors: Vec::new(),
        }
    }
}

const MIN_TOKEN_LEN: usize = 10;
const MAX_TOKEN_LEN: usize = 4096;

/// Minimum length for an FCM registration token.
const FCM_MIN_LEN: usize = 140;
/// FCM tokens at or beyond this length are issued to web clients.
const FCM_WEB_MIN_LEN: usize = 152;

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '[' | ']' | ':' | '_' | '-' | '.' | '+' | '/' | '=')
}

fn is_fcm_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-')
}

fn classify(token: &str) -> TokenValidation {
    if token.is_empty() {
        return TokenValidation::invalid("token is empty");
    }
    if token == "UNREGISTERED" {
        return TokenValidation::invalid("token is the UNREGISTERED placeholder");
    }
    if token.len() < MIN_TOKEN_LEN {
        return TokenValidation::invalid(format!(
            "token too short ({} chars, minimum {})",
            token.len(),
            MIN_TOKEN_LEN
        ));
    }
    if token.len() > MAX_TOKEN_LEN {
        return TokenValidation::invalid(format!(
            "token too long ({} chars, maximum {})",
            token.len(),
            MAX_TOKEN_LEN
        ));
    }
    if let Some(bad) = token.chars().find(|c| !is_allowed_char(*c)) {
        return TokenValidation::invalid(format!("token contains disallowed character {:?}", bad));
    }

    if token.starts_with("ExpoPushToken[") && token.ends_with(']') {
        return TokenValidation::valid(TokenFormat::Expo);
    }
    if token.starts_with("ExponentPushToken[") && token.ends_with(']') {
        return TokenValidation::valid(TokenFormat::ExpoLegacy);
    }

    // APNS device tokens are exactly 64 lowercase hex characters.
    if token.len() == 64
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return TokenValidation::valid(TokenFormat::Apns);
    }

    if token.len() >= FCM_MIN_LEN && token.chars().all(is_fcm_char) {
        if token.len() >= FCM_WEB_MIN_LEN {
            return TokenValidation::valid(TokenFormat::FcmWeb);
        }
        return TokenValidation::valid(TokenFormat::Fcm);
    }

    TokenValidation::invalid("unrecognized token format")
}

/// Validates device push tokens and computes health scores.
///
/// Holds a process-lifetime cache of validation outcomes keyed by the exact
/// token string. The cache is owned by this struct and injected through
/// `AppState` rather than living in a module-level global.
pub struct TokenValidator {
    cache: RwLock<HashMap<String, TokenValidation>>,
}

impl TokenValidator {
    pub fn new() -> Self {
        TokenValidator {
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Validate a raw token string, consulting the cache first.
    pub fn validate(&self, token: &str) -> TokenValidation {
        if let Some(cached) = self
            .cache
            .read()
            .ok()
            .and_then(|cache| cache.get(token).cloned())
        {
            return cached;
        }

        let result = classify(token);

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(token.to_string(), result.clone());
        }

        result
    }

    pub fn cache_size(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Compute a 0-100 health score for a stored token record.
    ///
    /// Scoring: +40 base when the token value validates, up to +20 each for
    /// token age and recency of last use (newer is higher), +5/+10 for the
    /// format family (legacy Expo earns the smaller bonus) and +5/+10 for
    /// device metadata being present.
    pub fn health_score(&self, record: &PushToken) -> i64 {
        let validation = self.validate(&record.token);
        if !validation.is_valid {
            return 0;
        }

        let mut score: i64 = 40;
        let now = Utc::now().naive_utc();

        let age_days = (now - record.created_at).num_days();
        score += match age_days {
            d if d < 7 => 20,
            d if d < 30 => 15,
            d if d < 90 => 10,
            _ => 5,
        };

        let idle_days = (now - record.last_used).num_days();
        score += match idle_days {
            d if d < 1 => 20,
            d if d < 7 => 15,
            d if d < 30 => 10,
            _ => 5,
        };

        score += match validation.format {
            Some(TokenFormat::ExpoLegacy) => 5,
            Some(_) => 10,
            None => 0,
        };

        let metadata_fields = [&record.device_id, &record.device_name]
            .iter()
            .filter(|f| f.is_some())
            .count();
        score += match metadata_fields {
            2 => 10,
            1 => 5,
            _ => 0,
        };

        score.clamp(0, 100)
    }
}

impl Default for TokenValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fcm_token(len: usize) -> String {
        "fcmtok:".chars().chain(std::iter::repeat('a')).take(len).collect()
    }

    fn record(token: &str, age_days: i64, idle_days: i64, with_device: bool) -> PushToken {
        let now = Utc::now().naive_utc();
        PushToken {
            id: "t1".to_string(),
            user_id: "u1".to_string(),
            user_type: "staff".to_string(),
            token: token.to_string(),
            platform: "android".to_string(),
            device_id: with_device.then(|| "device-1".to_string()),
            device_name: with_device.then(|| "Pixel 8".to_string()),
            app_version: None,
            is_active: true,
            health_score: None,
            audit_trail: String::new(),
            last_used: now - Duration::days(idle_days),
            created_at: now - Duration::days(age_days),
            updated_at: now,
        }
    }

    #[test]
    fn validation_is_deterministic_and_idempotent() {
        let validator = TokenValidator::new();
        let first = validator.validate("ExpoPushToken[abc123DEF456]");
        let second = validator.validate("ExpoPushToken[abc123DEF456]");
        assert_eq!(first, second);
        assert!(first.is_valid);
        assert_eq!(first.format, Some(TokenFormat::Expo));
        assert_eq!(validator.cache_size(), 1);
    }

    #[test]
    fn classifies_all_three_families() {
        let validator = TokenValidator::new();

        assert_eq!(
            validator.validate("ExpoPushToken[xxxxxxxxxxxxxxxxxxxxxx]").format,
            Some(TokenFormat::Expo)
        );
        assert_eq!(
            validator
                .validate("ExponentPushToken[xxxxxxxxxxxxxxxxxxxxxx]")
                .format,
            Some(TokenFormat::ExpoLegacy)
        );
        assert_eq!(
            validator.validate(&fcm_token(140)).format,
            Some(TokenFormat::Fcm)
        );
        assert_eq!(
            validator.validate(&fcm_token(160)).format,
            Some(TokenFormat::FcmWeb)
        );

        let apns: String = std::iter::repeat("0123456789abcdef").take(4).collect();
        assert_eq!(apns.len(), 64);
        assert_eq!(validator.validate(&apns).format, Some(TokenFormat::Apns));
    }

    #[test]
    fn uppercase_hex_is_not_apns() {
        let validator = TokenValidator::new();
        let token: String = std::iter::repeat("0123456789ABCDEF").take(4).collect();
        let result = validator.validate(&token);
        assert!(!result.is_valid);
    }

    #[test]
    fn rejects_malformed_tokens() {
        let validator = TokenValidator::new();

        assert!(!validator.validate("").is_valid);
        assert!(!validator.validate("short").is_valid);
        assert!(!validator.validate("UNREGISTERED").is_valid);
        assert!(!validator.validate("ExpoPushToken[has spaces!]").is_valid);

        let oversized = "a".repeat(MAX_TOKEN_LEN + 1);
        assert!(!validator.validate(&oversized).is_valid);

        let errors = validator.validate("").errors;
        assert!(!errors.is_empty());
    }

    #[test]
    fn health_score_stays_in_bounds() {
        let validator = TokenValidator::new();

        let fresh = record("ExpoPushToken[abcdef123456]", 0, 0, true);
        let fresh_score = validator.health_score(&fresh);
        assert_eq!(fresh_score, 100);

        let stale = record("ExpoPushToken[abcdef123456]", 400, 200, false);
        let stale_score = validator.health_score(&stale);
        assert!(stale_score < fresh_score);
        assert!((0..=100).contains(&stale_score));

        let invalid = record("UNREGISTERED", 0, 0, true);
        assert_eq!(validator.health_score(&invalid), 0);
    }

    #[test]
    fn legacy_format_earns_smaller_bonus() {
        let validator = TokenValidator::new();
        let modern = record("ExpoPushToken[abcdef123456]", 0, 0, true);
        let legacy = record("ExponentPushToken[abcdef123456]", 0, 0, true);
        assert!(validator.health_score(&legacy) < validator.health_score(&modern));
    }
}
