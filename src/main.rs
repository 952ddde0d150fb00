use anyhow::Context;
use gremlin_sigv4::{Bytecode, Connection, ConnectionOptions};
use serde_json::json;

const DEFAULT_LIMIT: i64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let limit = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<i64>()
            .with_context(|| format!("invalid vertex limit '{}'", arg))?,
        None => DEFAULT_LIMIT,
    };

    #[cfg(feature = "env-file")]
    let options = ConnectionOptions::from_env_file(".env")?;
    #[cfg(not(feature = "env-file"))]
    let options = ConnectionOptions::from_env()?;

    let connection = Connection::new(options)?;
    println!("Connecting to {}...", connection.url());
    connection.open().await.context("failed to open connection")?;

    let query = Bytecode::new()
        .add_step("V", vec![])
        .add_step("limit", vec![Bytecode::typed("g:Int64", json!(limit))]);

    let result = connection.submit(query).await;
    connection.close().await?;

    let traversers = result.context("traversal failed")?;
    println!("Found {} vertices", traversers.len());
    for traverser in &traversers {
        println!("{}", serde_json::to_string_pretty(traverser)?);
    }

    Ok(())
}
