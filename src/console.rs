use anyhow::Context;
use dc_auth::{AuthError, TokenAcquirer};
use dc_config::ApiSettings;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};

const PROMPT: &str = "\nPress 1 to invoke api endpoint or 2 to quit: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MenuChoice {
    Invoke,
    Quit,
    /// A number with no action bound to it
    Unbound,
    Invalid,
}

impl MenuChoice {
    fn parse(input: &str) -> Self {
        match input.trim().parse::<i32>() {
            Ok(1) => Self::Invoke,
            Ok(2) => Self::Quit,
            Ok(_) => Self::Unbound,
            Err(_) => Self::Invalid,
        }
    }
}

/// Menu loop until the user quits or stdin closes
pub async fn run(acquirer: &TokenAcquirer, api: &ApiSettings) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout.write_all(PROMPT.as_bytes()).await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await.context("Failed to read from stdin")? else {
            debug!("stdin closed, leaving menu");
            return Ok(());
        };

        match MenuChoice::parse(&line) {
            MenuChoice::Invoke => {
                if let Err(e) = invoke_api_endpoint(acquirer, &http, api).await {
                    warn!("API invocation failed: {:#}", e);
                    println!("{:#}", e);
                }
            }
            MenuChoice::Quit => return Ok(()),
            MenuChoice::Unbound => {}
            MenuChoice::Invalid => println!("Invalid input!"),
        }
    }
}

async fn invoke_api_endpoint(
    acquirer: &TokenAcquirer,
    http: &reqwest::Client,
    api: &ApiSettings,
) -> anyhow::Result<()> {
    let token = match acquirer.acquire_access_token().await {
        Ok(token) => token,
        Err(e @ AuthError::UnknownAuthError(_)) => {
            println!("Unknown error occured");
            return Err(e).context("Failed to authenticate");
        }
        Err(e) => {
            return Err(e).context(
                "Failed to authenticate. Please check the client id, tenant id and scopes!",
            );
        }
    };
    println!("Successfully authenticated!");

    println!("\nCalling {}....", api.path);
    let body = call_api(http, api, &token).await?;
    println!("Response:");
    println!("{}", body);

    Ok(())
}

/// `GET {base}{path}` with the access token as bearer credential
#[instrument(skip(http, token), fields(path = %api.path))]
async fn call_api(http: &reqwest::Client, api: &ApiSettings, token: &str) -> anyhow::Result<String> {
    let url = format!("{}{}", api.base_address.trim_end_matches('/'), api.path);

    let response = http
        .get(&url)
        .bearer_auth(token)
        .send()
        .await
        .with_context(|| format!("Failed to call {}", url))?
        .error_for_status()
        .with_context(|| format!("{} returned an error status", url))?;

    response
        .text()
        .await
        .context("Failed to read the response body")
}
