use bluestacks_agent::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), AgentError> {
    let config = AgentConfig::from_env().use_default_callbacks(false);
    bluestacks_agent::init_observability(&config.log);

    let callbacks = Callbacks::new()
        .on_progress(|frame: &Frame| {
            if let Some(step) = frame.step_index {
                println!("step {step}: {}", frame.output().unwrap_or("working"));
            }
        })
        .on_completed(|frame: &Frame| {
            println!("turn finished with event {}", frame.event);
        });

    let client = AgentClient::builder()
        .config(config)
        .callbacks(callbacks)
        .build()?;

    let result = client.run_task("Open the Play Store and search for chess").await;
    println!("success={} output={}", result.success, result.output);
    if !result.success {
        eprintln!("run error: {} ({})", result.reason, result.code());
    }

    client.close(true).await;
    Ok(())
}
