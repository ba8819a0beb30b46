use std::{net::SocketAddr, str::FromStr, sync::Arc};

use axum::extract::FromRef;
use oauth2::{
    basic::BasicClient, AuthUrl, ClientId, ClientSecret, EndpointNotSet, EndpointSet,
    RedirectUrl, TokenUrl,
};
use reqwest::{redirect::Policy, Client, ClientBuilder};
use s3::{creds::Credentials, Bucket, Region};

use crate::{
    codec::ImageCodec, convert::Converter, session::RedisSessions, storage::BucketUploader,
};

pub type OAuthClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

#[derive(Clone)]
pub struct AppState {
    pub uploader: BucketUploader,
    pub sessions: RedisSessions,
    pub converter: Converter,
    pub http: Client,
    pub oauth: Arc<OAuthClient>,
    pub oauth_scopes: Arc<[String]>,
    pub userinfo_url: Arc<str>,
    pub root_url: Arc<str>,
    pub secure_cookies: bool,
}

impl AppState {
    pub async fn new() -> Self {
        let root_url = get_root_url();
        let uploader = BucketUploader::new(get_bucket(), optional_var("PUBLIC_BUCKET_URL"));
        let sessions = RedisSessions::new(get_redis().await);
        let converter = Converter {
            sessions: Arc::new(sessions.clone()),
            codec: Arc::new(ImageCodec),
            uploader: Arc::new(uploader.clone()),
        };
        Self {
            uploader,
            sessions,
            converter,
            http: get_http(),
            oauth: get_oauth(&root_url).into(),
            oauth_scopes: get_scopes().into(),
            userinfo_url: parse_var::<String>("USERINFO_URL").into(),
            root_url: root_url.into(),
            secure_cookies: optional_var::<String>("SECURE_COOKIES")
                .as_deref()
                .map_or(true, crate::check_truthy),
        }
    }

    pub fn asset_dir() -> String {
        optional_var("ASSET_DIR").unwrap_or_else(|| "./assets".to_owned())
    }

    pub fn bind_address() -> SocketAddr {
        optional_var("BIND_ADDRESS").unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)))
    }
}

impl FromRef<AppState> for Converter {
    fn from_ref(state: &AppState) -> Self {
        state.converter.clone()
    }
}

fn get_root_url() -> String {
    optional_var::<String>("ROOT_URL").map_or_else(
        || {
            warn!("ROOT_URL not set, defaulting to http://localhost:8080");
            "http://localhost:8080".to_owned()
        },
        |url| url.trim_end_matches('/').to_owned(),
    )
}

fn get_bucket() -> Bucket {
    let name: String = parse_var("BUCKET_NAME");
    let region = Region::Custom {
        region: optional_var("S3_REGION").unwrap_or_else(|| "auto".to_owned()),
        endpoint: parse_var("S3_ENDPOINT"),
    };
    let access_key: String = parse_var("S3_ACCESS_KEY");
    let secret_key: String = parse_var("S3_SECRET_KEY");
    let credentials = Credentials::new(Some(&access_key), Some(&secret_key), None, None, None)
        .expect("S3 credentials must be valid");
    let bucket = Bucket::new(&name, region, credentials).expect("S3 bucket must be valid");
    *bucket.with_path_style()
}

fn get_http() -> Client {
    ClientBuilder::new()
        .user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ))
        // token endpoints must not be able to bounce us elsewhere
        .redirect(Policy::none())
        .build()
        .expect("failed to build HTTP client")
}

async fn get_redis() -> redis::aio::MultiplexedConnection {
    let url: String = parse_var("REDIS_URL");
    let client = redis::Client::open(url).expect("REDIS_URL must be a valid redis URL");
    client
        .get_multiplexed_async_connection()
        .await
        .expect("Failed to connect to redis")
}

fn get_scopes() -> Vec<String> {
    optional_var::<String>("OAUTH_SCOPES")
        .unwrap_or_else(|| "openid profile".to_owned())
        .split_whitespace()
        .map(str::to_owned)
        .collect()
}

fn get_oauth(root_url: &str) -> OAuthClient {
    let client_id = ClientId::new(parse_var("CLIENT_ID"));
    let client_secret = ClientSecret::new(parse_var("CLIENT_SECRET"));
    let auth_url = AuthUrl::new(parse_var("AUTH_URL")).expect("AUTH_URL must be a valid URL");
    let token_url = TokenUrl::new(parse_var("TOKEN_URL")).expect("TOKEN_URL must be a valid URL");
    let redirect_url = RedirectUrl::new(format!("{root_url}/oauth2/callback"))
        .expect("ROOT_URL must be a valid URL");
    BasicClient::new(client_id)
        .set_client_secret(client_secret)
        .set_auth_uri(auth_url)
        .set_token_uri(token_url)
        .set_redirect_uri(redirect_url)
}

fn parse_var<T>(name: &str) -> T
where
    T: FromStr,
    T::Err: std::fmt::Debug,
{
    std::env::var(name)
        .unwrap_or_else(|_| panic!("{name} required in the environment"))
        .parse()
        .unwrap_or_else(|_| panic!("{name} must be a valid {}", std::any::type_name::<T>()))
}

fn optional_var<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Debug,
{
    let value = std::env::var(name).ok().filter(|v| !v.is_empty())?;
    Some(
        value
            .parse()
            .unwrap_or_else(|_| panic!("{name} must be a valid {}", std::any::type_name::<T>())),
    )
}
