use axum::{
    extract::{Query, State},
    response::Redirect,
};
use axum_extra::extract::{
    cookie::{Cookie, SameSite},
    CookieJar,
};
use oauth2::{
    AuthorizationCode, CsrfToken, PkceCodeChallenge, PkceCodeVerifier, Scope, TokenResponse,
};
use serde_json::Value;
use tracing::instrument;

use crate::{
    session::{Identity, COOKIE_NAME},
    AppState, Error,
};

pub async fn redirect(State(state): State<AppState>) -> Result<Redirect, Error> {
    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
    let (auth_url, csrf_token) = state
        .oauth
        .authorize_url(CsrfToken::new_random)
        .add_scopes(state.oauth_scopes.iter().cloned().map(Scope::new))
        .set_pkce_challenge(pkce_challenge)
        .url();
    state
        .sessions
        .store_pkce(csrf_token.secret(), pkce_verifier.secret())
        .await?;
    Ok(Redirect::to(auth_url.as_str()))
}

#[instrument(skip_all)]
pub async fn authenticate(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<SetIdQuery>,
) -> Result<(CookieJar, Redirect), Error> {
    let pkce_secret = state
        .sessions
        .take_pkce(&query.state)
        .await?
        .ok_or(Error::InvalidState)?;
    let pkce_verifier = PkceCodeVerifier::new(pkce_secret);
    let token_result = state
        .oauth
        .exchange_code(AuthorizationCode::new(query.code))
        .set_pkce_verifier(pkce_verifier)
        .request_async(&state.http)
        .await?;
    let userinfo: Value = state
        .http
        .get(state.userinfo_url.as_ref())
        .bearer_auth(token_result.access_token().secret())
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let identity = Identity::from_userinfo(&userinfo).ok_or(Error::MissingUserId)?;

    let token = crate::randstring(64);
    state.sessions.create(&token, &identity).await?;
    info!(user = %identity.user_id, "User logged in");

    let cookie = Cookie::build((COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(state.secure_cookies)
        .same_site(SameSite::Lax);
    Ok((jar.add(cookie), Redirect::to("/")))
}

pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect), Error> {
    if let Some(token) = jar.get(COOKIE_NAME) {
        state.sessions.destroy(token.value()).await?;
    }
    let jar = jar.remove(Cookie::build(COOKIE_NAME).path("/"));
    Ok((jar, Redirect::to("/")))
}

#[derive(serde::Deserialize)]
pub struct SetIdQuery {
    code: String,
    state: String,
}
