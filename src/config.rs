use serde::Deserialize;

/// Runtime settings, read from the environment.
///
/// Prices are in minor currency units.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    /// Base URL of the public web app, used to build scan redirects.
    pub public_base_url: String,
    pub currency: String,
    pub monthly_price_minor: i64,
    pub yearly_price_minor: i64,
    pub lifetime_price_minor: i64,
    pub tag_price_minor: i64,
    pub replacement_price_minor: i64,
    pub referral_bonus_points: i64,
    pub stripe_secret_key: Option<String>,
    pub stripe_api_base: String,
    pub stripe_monthly_price_id: Option<String>,
    pub stripe_yearly_price_id: Option<String>,
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_from_number: Option<String>,
    pub twilio_api_base: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("server_port", 8000)?
            .set_default("database_max_connections", 8)?
            .set_default("public_base_url", "http://localhost:3000")?
            .set_default("currency", "gbp")?
            .set_default("monthly_price_minor", 275)?
            .set_default("yearly_price_minor", 2750)?
            .set_default("lifetime_price_minor", 9900)?
            .set_default("tag_price_minor", 1499)?
            .set_default("replacement_price_minor", 499)?
            .set_default("referral_bonus_points", 100)?
            .set_default("stripe_api_base", "https://api.stripe.com")?
            .set_default("twilio_api_base", "https://api.twilio.com")?
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }
}

/// Local defaults with the in-memory store.
impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 8000,
            database_url: "memory://".into(),
            database_max_connections: 8,
            public_base_url: "http://localhost:3000".into(),
            currency: "gbp".into(),
            monthly_price_minor: 275,
            yearly_price_minor: 2750,
            lifetime_price_minor: 9900,
            tag_price_minor: 1499,
            replacement_price_minor: 499,
            referral_bonus_points: 100,
            stripe_secret_key: None,
            stripe_api_base: "https://api.stripe.com".into(),
            stripe_monthly_price_id: None,
            stripe_yearly_price_id: None,
            twilio_account_sid: None,
            twilio_auth_token: None,
            twilio_from_number: None,
            twilio_api_base: "https://api.twilio.com".into(),
        }
    }
}
