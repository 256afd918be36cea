use clap::Args as ClapArgs;

const DEFAULT_API_URL: &str = "https://graph.facebook.com/v19.0";
const DEFAULT_PAGE_LIMIT: &str = "100";
const OUTPUT_DIR: &str = "./output";
const CHECKPOINT_PATH: &str = "./output/last_processed";

#[derive(ClapArgs, Clone, Debug)]
pub struct Config {
    #[arg(long, default_value = DEFAULT_API_URL, env = "FACEBOOK_API_URL")]
    pub(crate) api_url: String,

    #[arg(long, env = "FACEBOOK_ACCESS_TOKEN", hide_env_values = true)]
    pub(crate) access_token: String,

    #[arg(long, env = "FACEBOOK_AD_ACCOUNT_ID")]
    pub(crate) ad_account_id: String,

    #[arg(long, default_value = DEFAULT_PAGE_LIMIT, env = "PAGE_LIMIT")]
    pub(crate) page_limit: u32,

    #[arg(long, default_value = OUTPUT_DIR, env = "OUTPUT_DIR")]
    pub(crate) output_dir: String,

    #[arg(long, default_value = CHECKPOINT_PATH, env = "CHECKPOINT_PATH")]
    pub(crate) checkpoint_path: String,
}

impl Config {
    /// Account id without the `act_` prefix the dashboard shows.
    pub fn account_id(&self) -> &str {
        let id = self.ad_account_id.trim();
        id.strip_prefix("act_").unwrap_or(id)
    }
}

#[cfg(test)]
pub(crate) fn test_config(api_url: &str) -> Config {
    Config {
        api_url: api_url.to_string(),
        access_token: "test_token".to_string(),
        ad_account_id: "act_12345".to_string(),
        page_limit: 100,
        output_dir: "/path/to/output".to_string(),
        checkpoint_path: "/path/to/output/last_processed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_strips_prefix() {
        let config = test_config("https://api.example.com");
        assert_eq!(config.account_id(), "12345");
    }

    #[test]
    fn test_account_id_without_prefix() {
        let mut config = test_config("https://api.example.com");
        config.ad_account_id = " 98765 ".to_string();
        assert_eq!(config.account_id(), "98765");
    }
}
