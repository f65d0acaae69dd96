use std::env;

use inops_search::controller::SearchController;
use inops_search::mock::MockBackend;
use inops_search::session::SearchUpdate;
use inops_search::transport::FlowClient;
use inops_search::SearchConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    dotenv::dotenv().ok();
    log::info!("🔎 Starting streaming search demo...");

    let query: String = env::args().skip(1).collect::<Vec<_>>().join(" ");
    let query = if query.trim().is_empty() {
        "kid longboard beginner".to_string()
    } else {
        query
    };

    // Without a configured backend, run against the embedded mock.
    let mut _backend = None;
    let config = if env::var("INOPS_API_BASE_URL").is_ok() {
        SearchConfig::from_env()?
    } else {
        let backend = MockBackend::spawn("demo-key").await?;
        log::info!("📡 INOPS_API_BASE_URL not set, using mock backend at {}", backend.base_url());
        let config = SearchConfig::new(backend.base_url(), "demo-key");
        _backend = Some(backend);
        config
    };

    let (controller, mut updates) = SearchController::new(FlowClient::new(config));
    log::info!("💬 Query: {:?}", query);
    controller.submit_now(&query);

    while let Some(update) = updates.recv().await {
        let terminal = update.is_terminal();
        match update {
            SearchUpdate::Cleared => log::info!("🧹 Results cleared"),
            SearchUpdate::Searching => log::info!("⏳ Searching..."),
            SearchUpdate::Summary { text } => log::info!("📝 {}", text),
            SearchUpdate::Products { added } => {
                for product in &added {
                    match product.score_percent() {
                        Some(pct) => log::info!("🛒 {} ({:.0}%)", product.title, pct),
                        None => log::info!("🛒 {}", product.title),
                    }
                }
            }
            SearchUpdate::Completed(result) => {
                log::info!("✅ Done: {} products", result.products.len());
            }
            SearchUpdate::TimedOut(partial) => {
                log::info!("⌛ Timed out with {} partial products", partial.products.len());
            }
            SearchUpdate::Failed { message } => log::error!("❌ {}", message),
        }
        if terminal {
            break;
        }
    }

    controller.shutdown();
    Ok(())
}
