//! Authentication against the printer's companion HTTP endpoint.
//!
//! The printer hands out JSON-RPC access tokens over plain HTTP: request a
//! code, poll until the request is accepted (a knob press on the printer,
//! or an already-authorized Thingiverse account), then trade the code for
//! a token scoped to the `jsonrpc` context.

use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};

/// Pause between answer polls.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How many times the Thingiverse flow polls before giving up.
const THINGIVERSE_POLL_ATTEMPTS: usize = 10;

async fn auth_get(http: &reqwest::Client, ip: &str, query: &[(&str, &str)]) -> Result<Value> {
    let url = format!("http://{ip}/auth");
    let response = http.get(&url).query(query).send().await?;
    Ok(response.json().await?)
}

fn field<'a>(value: &'a Value, key: &str) -> Result<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::AuthRefused(format!("auth response missing `{key}` field")))
}

/// Obtain an access token by having the user press the printer's knob.
/// Polls until the request is accepted.
pub(crate) async fn local_access_token(
    ip: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<String> {
    let http = reqwest::Client::new();

    let code_response = auth_get(
        &http,
        ip,
        &[
            ("response_type", "code"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ],
    )
    .await?;
    let answer_code = field(&code_response, "answer_code")?.to_string();

    tracing::debug!("waiting for knob press on the printer");
    let answer_response = loop {
        let answer_response = auth_get(
            &http,
            ip,
            &[
                ("response_type", "answer"),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("answer_code", &answer_code),
            ],
        )
        .await?;

        if field(&answer_response, "answer")? == "accepted" {
            break answer_response;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    fetch_token(&http, ip, client_id, client_secret, field(&answer_response, "code")?).await
}

/// Obtain an access token via a Thingiverse token/username pair. Bounded
/// polling: the account must already be authorized on the printer.
pub(crate) async fn thingiverse_access_token(
    ip: &str,
    client_id: &str,
    client_secret: &str,
    thingiverse_token: &str,
    username: &str,
) -> Result<String> {
    let http = reqwest::Client::new();

    let code_response = auth_get(
        &http,
        ip,
        &[
            ("response_type", "code"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("thingiverse_token", thingiverse_token),
            ("username", username),
        ],
    )
    .await?;
    let answer_code = field(&code_response, "answer_code")?.to_string();

    let mut accepted = None;
    for _ in 0..THINGIVERSE_POLL_ATTEMPTS {
        let answer_response = auth_get(
            &http,
            ip,
            &[
                ("response_type", "answer"),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("answer_code", &answer_code),
            ],
        )
        .await?;

        if field(&answer_response, "answer")? == "accepted" {
            accepted = Some(answer_response);
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let answer_response = accepted.ok_or_else(|| {
        Error::AuthRefused(
            "printer did not accept the Thingiverse credentials; check that the account is \
             authorized on this printer"
                .to_string(),
        )
    })?;

    fetch_token(&http, ip, client_id, client_secret, field(&answer_response, "code")?).await
}

async fn fetch_token(
    http: &reqwest::Client,
    ip: &str,
    client_id: &str,
    client_secret: &str,
    auth_code: &str,
) -> Result<String> {
    let token_response = auth_get(
        http,
        ip,
        &[
            ("response_type", "token"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("context", "jsonrpc"),
            ("auth_code", auth_code),
        ],
    )
    .await?;

    Ok(field(&token_response, "access_token")?.to_string())
}
