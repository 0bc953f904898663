use anyhow::{bail, Context, Result};
use bible_content_sync::{
    api::ApiClient,
    cache::MemoryCache,
    config::Config,
    content::{ContentKind, ContentRecord},
    db::Database,
    installer::{DocumentAttributes, InterfaceInstaller, MessageTable},
    resolver::ContentResolver,
    services::{CommonContentService, InterfaceService, LessonContentService, SiteContentService},
};
use std::sync::Arc;
use tracing::{info, warn};

fn print_usage() {
    println!(
        r#"
bible-content-sync - resolve translated study content

USAGE:
    bible-content-sync <COMMAND> [ARGS]

COMMANDS:
    interface <hl>                       Load and install interface messages
    common <study> <hl> [variant]        Load common study content
    lesson <study> <hl> <jf> <lesson>    Load lesson content
    site <hl>                            Load site content (normalized)
    clear [partition]                    Clear one store partition, or the whole store
    help                                 Show this message

ENVIRONMENT VARIABLES:
    API_BASE_URL          Root of the content API (required)
    DATABASE_PATH         Local store file (unset: no local persistence)
    SITE_CODE             Site identifier (default: myfriends)
    FALLBACK_HL           Interface fallback language (default: eng00)
    POLL_MAX_ATTEMPTS     Completion poll attempts (default: 5)
    POLL_INTERVAL_MS      Delay between poll attempts (default: 300)
    REQUIRE_CRON_KEY      Fail polls lacking a cron key (default: true)
    HTTP_TIMEOUT_SECS     HTTP timeout (default: 30)
"#
    );
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .with_context(|| format!("missing argument <{}>", name))
}

fn print_record(record: &ContentRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record.as_value())?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored when absent)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bible_content_sync=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1) else {
        print_usage();
        return Ok(());
    };
    if matches!(command.as_str(), "help" | "--help" | "-h") {
        print_usage();
        return Ok(());
    }

    let config = Config::from_env()?;

    let api = ApiClient::new(&config.api_base_url, config.http_timeout())?;
    let db = match &config.database_path {
        Some(path) => Database::new(path),
        None => Database::unavailable(),
    };
    let resolver = Arc::new(
        ContentResolver::new(api, db.clone(), Arc::new(MemoryCache::new()))
            .with_poll_options(config.poll_options()),
    );

    match command.as_str() {
        "interface" => {
            let hl = arg(&args, 2, "hl")?;
            let installer = Arc::new(InterfaceInstaller::new(
                Arc::new(MessageTable::new()),
                Arc::new(DocumentAttributes::new()),
            ));
            let service = InterfaceService::new(Arc::clone(&resolver), installer)
                .with_fallback_hl(&config.fallback_hl);
            match service.load(hl).await? {
                Some(record) => print_record(&record)?,
                None => warn!("No interface translation available for {}", hl),
            }
        }
        "common" => {
            let study = arg(&args, 2, "study")?;
            let hl = arg(&args, 3, "hl")?;
            let variant = args.get(4).map(String::as_str);
            let record = CommonContentService::new(Arc::clone(&resolver))
                .load(study, hl, variant)
                .await?;
            print_record(&record)?;
        }
        "lesson" => {
            let study = arg(&args, 2, "study")?;
            let hl = arg(&args, 3, "hl")?;
            let jf = arg(&args, 4, "jf")?;
            let lesson = arg(&args, 5, "lesson")?;
            let record = LessonContentService::new(Arc::clone(&resolver))
                .load(study, hl, jf, lesson)
                .await?;
            print_record(&record)?;
        }
        "site" => {
            let hl = arg(&args, 2, "hl")?;
            let site = SiteContentService::new(Arc::clone(&resolver), &config.site_code)
                .load_normalized(hl)
                .await?;
            println!("{}", serde_json::to_string_pretty(&site)?);
        }
        "clear" => {
            let cleared = match args.get(2) {
                Some(name) => db.clear_partition(name.parse::<ContentKind>()?).await?,
                None => db.clear_all().await?,
            };
            if !cleared {
                warn!("Nothing cleared: local store not available");
            }
            return Ok(());
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            bail!("unknown command {}", other);
        }
    }

    if resolver.poller().in_flight_count() > 0 {
        info!("Waiting for background translation polls to settle");
    }
    resolver.settle_background_polls().await;
    info!("Resolution summary: {}", serde_json::to_string(&resolver.metrics())?);
    Ok(())
}
