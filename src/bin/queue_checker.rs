use clap::Parser;
use crawlfleet::config::CrawlConfig;
use crawlfleet::redis_store::RedisStore;
use crawlfleet::store::SharedStore;
use crawlfleet::CrawlError;
use dotenv::dotenv;

/// Prints the remote queue depth and which filter shards exist for a
/// spider.
#[derive(Parser, Debug)]
#[command(name = "queue_checker")]
struct Args {
    /// Defaults to CRAWL_SPIDER.
    #[arg(long)]
    spider: Option<String>,
    /// Defaults to CRAWL_STORE_URL.
    #[arg(long)]
    url: Option<String>,
}

fn main() -> Result<(), CrawlError> {
    dotenv().ok();
    crawlfleet::init_tracing("queue_checker");
    let args = Args::parse();

    let mut config = CrawlConfig::from_env()?;
    if let Some(spider) = args.spider {
        config.spider = spider;
    }
    if let Some(url) = args.url {
        config.store_url = url;
    }

    let store = RedisStore::connect(&config.store_url)?;
    let queue_key = config.queue_key();
    println!("{} depth: {}", queue_key, store.list_len(&queue_key)?);

    let prefix = config.dupefilter_key();
    for shard in 0..config.filter_shards {
        let key = format!("{}{}", prefix, shard);
        let present = if store.exists(&key)? { "present" } else { "absent" };
        println!("{}: {}", key, present);
    }
    Ok(())
}
