use pearl_gpt::{app, Configuration};
use tracing_subscriber::EnvFilter;

// 工作线程数按 cpu / (1 - IO占比) 估算，IO占比取0.65。两核机器上为6线程。
const THREAD_IO_RATIO: f64 = 0.65;

fn worker_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus as f64 / (1.0 - THREAD_IO_RATIO)).ceil() as usize
}

fn main() {
    // Setup tracing
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Read in configuration from OS env.
    let config: Configuration = envy::from_env()
        .expect("Please provide APP_TOKEN, WECHAT_APPID, WECHAT_SECRET, OPENAI_ENDPOINT and OPENAI_API_KEY env vars");
    if let Err(e) = config.validate() {
        panic!("配置无效，拒绝启动。{e}");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads())
        .enable_all()
        .build()
        .expect("Tokio runtime should be built");
    runtime.block_on(serve(config));
}

async fn serve(config: Configuration) {
    let service = app(&config);

    tracing::info!("Listening on port {}..", config.port);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .expect("Port should be bound");
    axum::serve(listener, service)
        .await
        .expect("Server should run");
}
