use bluestacks_agent::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), AgentError> {
    let client = AgentClient::new(AgentConfig::from_env())?;

    for result in [
        client.home().await,
        client.start_app("com.android.settings", None).await,
        client.tap(540, 960).await,
    ] {
        if result.success {
            println!("{}", result.output);
        } else {
            eprintln!("{}", result.reason);
        }
    }

    let png = client.screenshot(Some("settings.png".as_ref())).await?;
    println!("screenshot: {} bytes", png.len());

    client.close(false).await;
    Ok(())
}
