use tuya_scale_client::{
    config::Config, http_client::ReqwestScaleClient, paginator::HistoryPaginator,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Example: expects TUYA_ACCESS_ID, TUYA_ACCESS_KEY, TUYA_DEVICE_ID and TUYA_BIRTHDATE in env
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {}", e);
            return Ok(());
        }
    };
    let client = ReqwestScaleClient::with_options(
        cfg.endpoint(),
        cfg.credentials.access_id.clone(),
        cfg.credentials.access_key.clone(),
        cfg.client_options(),
    )?;

    // History is served oldest first; walk to the end and keep the last page.
    let mut pages = HistoryPaginator::new(&client, cfg.credentials.device_id.clone(), 10, None);
    let mut latest = Vec::new();
    while let Some(page) = pages.next_page().await? {
        if !page.is_empty() {
            latest = page;
        }
    }
    for r in latest {
        println!(
            "{} {} {:.1} kg, {:.0} ohm",
            r.record_id, r.created_at, r.weight, r.body_resistance
        );
    }
    Ok(())
}
