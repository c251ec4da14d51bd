//! Server configuration, from flags or environment.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "treecall-server", about = "Call tree server over WebSocket")]
pub struct ServerConfig {
    /// HTTP/WebSocket listen address (host:port)
    #[arg(long, env = "TREECALL_LISTEN", default_value = "127.0.0.1:2990")]
    pub listen_addr: String,

    /// Name of the tree root; every call path starts with it
    #[arg(long, env = "TREECALL_ROOT", default_value = "Tree")]
    pub root_name: String,

    /// Outbound frames buffered per connection before it is dropped
    #[arg(long, default_value_t = 4096)]
    pub send_queue: usize,

    /// Seconds a single WebSocket write may take before the peer is
    /// considered dead
    #[arg(long, default_value_t = 30)]
    pub send_timeout_secs: u64,

    /// Programs the `$exec` branch may run (comma separated)
    #[arg(
        long,
        env = "TREECALL_EXEC_ALLOW",
        value_delimiter = ',',
        default_values_t = [String::from("ls"), String::from("pwd")]
    )]
    pub exec_allow: Vec<String>,

    /// Minimum size of a background command's output notification
    #[arg(long, default_value_t = 1024)]
    pub exec_chunk_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:2990".to_string(),
            root_name: "Tree".to_string(),
            send_queue: 4096,
            send_timeout_secs: 30,
            exec_allow: vec!["ls".to_string(), "pwd".to_string()],
            exec_chunk_bytes: 1024,
        }
    }
}

impl ServerConfig {
    pub fn send_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.send_timeout_secs)
    }
}
