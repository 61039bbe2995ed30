use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{bail, WrapErr};
use quickbase_auth::{
    config::AuthConfig, AuthStrategy, Realm, Strategy, TempTokenStrategy, UserToken,
};
use reqwest::StatusCode;

#[derive(Debug, Parser)]
struct Opts {
    /// The realm hostname, such as `acme.quickbase.com`
    #[arg(short, long, env = "QB_REALM")]
    realm: Realm,

    /// A user token used to fetch temporary tokens
    #[arg(short, long, env = "QB_USER_TOKEN", hide_env_values = true)]
    user_token: Option<UserToken>,

    /// A JSON file describing the credentials to use instead
    #[arg(short, long, env = "QB_AUTH_CONFIG", conflicts_with = "user_token")]
    config: Option<PathBuf>,

    /// The table or app to obtain a token for
    #[arg(short = 'k', long, env = "QB_RESOURCE_KEY", default_value = "")]
    resource_key: String,
}

fn strategy(opts: Opts, client: reqwest::Client) -> color_eyre::Result<Strategy> {
    if let Some(path) = opts.config {
        let raw = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        let config: AuthConfig = serde_json::from_str(&raw).wrap_err("parsing credentials")?;
        return Ok(config.build(client)?);
    }

    let Some(user_token) = opts.user_token else {
        bail!("either a user token or a credentials file is required");
    };

    Ok(TempTokenStrategy::builder(opts.realm)
        .with_user_token(user_token)
        .build(client)?
        .into())
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let resource_key = opts.resource_key.clone();

    let client = reqwest::Client::builder().https_only(true).build()?;
    let strategy = strategy(opts, client)?;

    tracing::info!(scheme = %strategy.scheme(), "authenticating");

    let token = strategy.get_token(&resource_key).await?;
    tracing::info!(
        token = format_args!("{:#?}", token),
        "first access token"
    );

    let cached = strategy.get_token(&resource_key).await?;
    tracing::info!(reused = (cached == token), "second access token");

    match strategy
        .handle_auth_error(StatusCode::UNAUTHORIZED, &resource_key, 0, 2)
        .await?
    {
        Some(token) => tracing::info!(
            token = format_args!("{:#?}", token),
            "token after simulated rejection"
        ),
        None => tracing::warn!("strategy offers no refresh after a rejection"),
    }

    Ok(())
}
