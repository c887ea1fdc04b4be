use std::time::Duration;

use goose::prelude::*;
use rand::Rng;
use serde_json::json;

async fn setup_custom_client(user: &mut GooseUser) -> TransactionResult {
    use reqwest::Client;

    let builder = Client::builder().cookie_store(true).gzip(true);
    user.set_client_builder(builder).await?;
    Ok(())
}

async fn session_roundtrip(user: &mut GooseUser) -> TransactionResult {
    let mut goose = user.post_json("/api/sessions", &json!({})).await?;
    let response = goose
        .response
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    if status.as_u16() != 201 {
        return user.set_failure(
            &format!("create status {}", status.as_u16()),
            &mut goose.request,
            None,
            Some(&body),
        );
    }
    let parsed: serde_json::Value = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(_) => return user.set_failure("invalid json", &mut goose.request, None, Some(&body)),
    };
    let Some(session_id) = parsed.get("session_id").and_then(|value| value.as_str()) else {
        return user.set_failure("missing session_id", &mut goose.request, None, Some(&body));
    };
    let path = format!("/api/sessions/{session_id}");

    let mut info = user.get(&path).await?;
    if let Ok(response) = &info.response {
        if !response.status().is_success() {
            let code = response.status().as_u16();
            user.set_failure(&format!("info status {code}"), &mut info.request, None, None)?;
        }
    }

    let pause = rand::rng().random_range(50..250);
    tokio::time::sleep(Duration::from_millis(pause)).await;

    let mut terminated = user.delete(&path).await?;
    if let Ok(response) = &terminated.response {
        if response.status().as_u16() != 204 {
            let code = response.status().as_u16();
            return user.set_failure(
                &format!("terminate status {code}"),
                &mut terminated.request,
                None,
                None,
            );
        }
    }
    Ok(())
}

async fn health(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get("/healthz").await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("session_roundtrip")
                .register_transaction(transaction!(setup_custom_client).set_on_start())
                .register_transaction(transaction!(session_roundtrip).set_weight(4)?)
                .register_transaction(transaction!(health)),
        )
        .execute()
        .await?;
    Ok(())
}
