use std::collections::HashSet;
use std::time::Duration;

use clap::Parser;
use reqwest::Url;

use evalbot_engine::api::{AdmissionConfig, BotConfig, HttpLimits, RedisConfig, SandboxLimits};

const DEFAULT_SERVICE_URL: &str = "https://bsky.social";

fn default_service_url() -> Url {
    Url::parse(DEFAULT_SERVICE_URL).expect("DEFAULT_SERVICE_URL must be a valid URL")
}

#[derive(Debug, Clone, Parser)]
#[command(name = "evalbot", version, about = "Firehose code-evaluation bot")]
pub struct Cli {
    /// Account identifier (handle or DID). Falls back to the credentials file.
    #[arg(long, env = "EVALBOT_IDENTIFIER")]
    pub identifier: Option<String>,

    /// App password. Falls back to the credentials file.
    #[arg(long, env = "EVALBOT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Protocol service base URL.
    #[arg(long, env = "EVALBOT_SERVICE", default_value_t = default_service_url())]
    pub service: Url,

    /// Jetstream subscription endpoint.
    #[arg(
        long,
        env = "EVALBOT_FIREHOSE_URL",
        default_value = BotConfig::DEFAULT_FIREHOSE_URL
    )]
    pub firehose_url: String,

    /// Run the interactive REPL instead of the bot.
    #[arg(long)]
    pub repl: bool,

    /// Dispatch mentions through the durable redis queue.
    #[arg(long, env = "EVALBOT_USE_QUEUE")]
    pub use_queue: bool,

    #[arg(long, env = "EVALBOT_REDIS_HOST", default_value = "127.0.0.1")]
    pub redis_host: String,

    #[arg(long, env = "EVALBOT_REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    #[arg(
        long,
        env = "EVALBOT_QUEUE_NAME",
        default_value = BotConfig::DEFAULT_QUEUE_NAME
    )]
    pub queue_name: String,

    /// Number of parallel queue consumers.
    #[arg(
        long,
        env = "EVALBOT_CONCURRENCY",
        default_value_t = BotConfig::DEFAULT_CONCURRENCY as u16,
        value_parser = clap::value_parser!(u16).range(1..=512)
    )]
    pub concurrency: u16,

    /// DIDs allowed to use the admin command surface (repeatable or
    /// comma-separated).
    #[arg(long = "admin-did", env = "EVALBOT_ADMIN_DIDS", value_delimiter = ',')]
    pub admin_dids: Vec<String>,

    /// Sandbox wall-clock budget in milliseconds.
    #[arg(long, env = "EVALBOT_TIMEOUT_MS", default_value_t = 5_000)]
    pub timeout_ms: u64,

    /// Sandbox heap cap in bytes.
    #[arg(long, env = "EVALBOT_HEAP_BYTES", default_value_t = SandboxLimits::DEFAULT_HEAP_BYTES)]
    pub heap_bytes: usize,

    /// Sandbox stack cap in bytes.
    #[arg(long, env = "EVALBOT_STACK_BYTES", default_value_t = SandboxLimits::DEFAULT_STACK_BYTES)]
    pub stack_bytes: usize,

    /// Max HTTP requests per eval.
    #[arg(long, env = "EVALBOT_HTTP_PER_EVAL", default_value_t = HttpLimits::DEFAULT_PER_EVAL_LIMIT)]
    pub http_per_eval: u32,

    /// Max HTTP requests per principal per rolling window.
    #[arg(long, env = "EVALBOT_HTTP_WINDOW_LIMIT", default_value_t = HttpLimits::DEFAULT_WINDOW_LIMIT)]
    pub http_window_limit: u32,

    /// Rolling window length in seconds.
    #[arg(long, env = "EVALBOT_HTTP_WINDOW_SECS", default_value_t = 60)]
    pub http_window_secs: u64,

    /// Max outbound POST body in bytes.
    #[arg(long, env = "EVALBOT_POST_BODY_LIMIT", default_value_t = HttpLimits::DEFAULT_POST_BODY_LIMIT_BYTES)]
    pub post_body_limit: usize,

    /// Max response body in bytes.
    #[arg(long, env = "EVALBOT_RESPONSE_SIZE_LIMIT", default_value_t = HttpLimits::DEFAULT_RESPONSE_SIZE_LIMIT_BYTES)]
    pub response_size_limit: usize,

    /// Deadline for one outbound HTTP request in milliseconds.
    #[arg(long, env = "EVALBOT_HTTP_TIMEOUT_MS", default_value_t = 5_000)]
    pub http_timeout_ms: u64,

    /// Per-principal cooldown in milliseconds.
    #[arg(long, env = "EVALBOT_COOLDOWN_MS", default_value_t = 5_000)]
    pub cooldown_ms: u64,

    /// Global in-flight cap. Defaults to 100 (direct) or 1000 (queue).
    #[arg(long, env = "EVALBOT_MAX_IN_FLIGHT")]
    pub max_in_flight: Option<usize>,
}

impl Cli {
    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            timeout: Duration::from_millis(self.timeout_ms),
            heap_bytes: self.heap_bytes,
            stack_bytes: self.stack_bytes,
        }
    }

    pub fn http_limits(&self) -> HttpLimits {
        HttpLimits {
            per_eval_limit: self.http_per_eval,
            window_limit: self.http_window_limit,
            window: Duration::from_secs(self.http_window_secs),
            post_body_limit_bytes: self.post_body_limit,
            response_size_limit_bytes: self.response_size_limit,
            request_timeout: Duration::from_millis(self.http_timeout_ms),
        }
    }

    fn admission_config(&self) -> AdmissionConfig {
        let max_in_flight = self.max_in_flight.unwrap_or(if self.use_queue {
            AdmissionConfig::DEFAULT_MAX_IN_FLIGHT_QUEUE
        } else {
            AdmissionConfig::DEFAULT_MAX_IN_FLIGHT_DIRECT
        });
        AdmissionConfig {
            cooldown: Duration::from_millis(self.cooldown_ms),
            max_in_flight,
        }
    }

    /// Builds the engine configuration with resolved credentials.
    pub fn bot_config(&self, identifier: String, password: String) -> BotConfig {
        BotConfig {
            service: self.service.clone(),
            identifier,
            password,
            firehose_url: self.firehose_url.clone(),
            use_queue: self.use_queue,
            redis: RedisConfig {
                host: self.redis_host.clone(),
                port: self.redis_port,
            },
            queue_name: self.queue_name.clone(),
            concurrency: self.concurrency as usize,
            admin_dids: self
                .admin_dids
                .iter()
                .map(|did| did.trim().to_string())
                .filter(|did| !did.is_empty())
                .collect::<HashSet<_>>(),
            sandbox: self.sandbox_limits(),
            http: self.http_limits(),
            admission: self.admission_config(),
            reply_grapheme_limit: BotConfig::DEFAULT_REPLY_GRAPHEME_LIMIT,
        }
    }
}
