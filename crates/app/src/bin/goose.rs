use goose::prelude::*;
use rand::Rng;
use serde_json::json;

const LINES_PER_RUN: usize = 200;

async fn setup_custom_client(user: &mut GooseUser) -> TransactionResult {
    use reqwest::Client;

    let builder = Client::builder().cookie_store(true).gzip(true);
    user.set_client_builder(builder).await?;
    Ok(())
}

fn python_payload(marker: u32) -> serde_json::Value {
    json!({
        "code": format!(
            "for i in range({LINES_PER_RUN}):\n    print(i)\nprint('marker {marker}')\n"
        ),
    })
}

async fn python_roundtrip(user: &mut GooseUser) -> TransactionResult {
    let marker: u32 = rand::rng().random_range(1_000_000..9_999_999);
    let payload = python_payload(marker);
    let mut goose = user.post_json("/vm/default/python", &payload).await?;
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
    if !status.is_success() {
        return user.set_failure(
            &format!("status {}", status.as_u16()),
            &mut goose.request,
            None,
            Some(&body),
        );
    }
    let expected = format!("data: marker {marker}");
    if !body.lines().any(|line| line == expected) {
        return user.set_failure("missing marker line", &mut goose.request, None, Some(&body));
    }
    if body.contains("data: timeout") || body.contains("data: internal-error") {
        return user.set_failure("abnormal terminal event", &mut goose.request, None, Some(&body));
    }
    Ok(())
}

async fn heartbeat(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.post("/heartbeat", "").await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("python_roundtrip")
                .register_transaction(transaction!(setup_custom_client).set_on_start())
                .register_transaction(transaction!(python_roundtrip))
                .register_transaction(transaction!(heartbeat)),
        )
        .execute()
        .await?;
    Ok(())
}
