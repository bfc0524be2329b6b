#[cfg(not(unix))]
compile_error!("Only unix is currently supported");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = courier::config::find_config_file()?;
    let courier = courier::config::load(&path)?;

    courier.run().await
}
