use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use futures::StreamExt;
use tessera_session::{
    gateway::{AuthorityConfig, ReqwestAuthority, DEFAULT_REQUEST_TIMEOUT},
    store::FileStore,
    AuthError, AuthStateMachine, PasswordGrant, Password, Username,
};

#[derive(Debug, Parser)]
struct Opts {
    /// The base URL of the authority
    #[clap(short, long, env)]
    issuer: reqwest::Url,

    /// The user to log in as, if there is no stored session
    #[clap(short, long, env)]
    username: Username,

    /// The user's password
    #[clap(short, long, env, hide_env_values = true)]
    password: Password,

    /// The local directory used to persist the session
    #[clap(short = 'd', long, env, default_value = ".session")]
    session_dir: PathBuf,

    /// Log out and exit once the session has been established
    #[clap(long)]
    logout: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let authority = ReqwestAuthority::with_timeout(
        AuthorityConfig::for_issuer(&opts.issuer)?,
        DEFAULT_REQUEST_TIMEOUT,
    )?;
    let store = FileStore::new(opts.session_dir);
    tracing::debug!(dir = %store.dir().display(), "persisting session");

    let session = AuthStateMachine::new(
        Arc::new(authority),
        Arc::new(store),
    );

    let tokens = match session.init().await {
        Ok(tokens) => {
            tracing::info!("restored stored session");
            tokens
        }
        Err(error) if error.is_no_stored_session() || error == AuthError::SessionExpired => {
            tracing::info!(
                username = %opts.username,
                reason = %error,
                "no usable session, logging in"
            );
            session
                .login(&PasswordGrant::new(opts.username, opts.password))
                .await?
        }
        Err(error) => return Err(error.into()),
    };

    tracing::info!(
        token = format_args!("{:#?}", tokens.access_token()),
        expiry = tokens.expiration_date().0,
        "current access token"
    );

    if let Some(profile) = session.state().profile() {
        tracing::info!(
            sub = ?profile.sub,
            name = ?profile.name,
            roles = ?profile.role,
            "logged in"
        );
    }

    if opts.logout {
        session.logout().await;
        return Ok(());
    }

    let mut tokens = session.watcher().tokens();
    while let Some(tokens) = tokens.next().await {
        match tokens {
            Some(tokens) => tracing::info!(
                token = format_args!("{:#?}", tokens.access_token()),
                expiry = tokens.expiration_date().0,
                scheduled = ?session.scheduled_refresh(),
                "access token"
            ),
            None => {
                tracing::warn!("session ended");
                break;
            }
        }
    }

    Ok(())
}
