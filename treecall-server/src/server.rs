//! Server bootstrap: assemble the tree, wait for it to be ready, serve it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::tree::{Branch, ChatBranch, Dispatcher, ExecBranch, SystemBranch};

/// State shared by every HTTP handler.
pub struct SharedState {
    pub dispatcher: Arc<Dispatcher>,
    pub config: ServerConfig,
}

pub struct Server {
    config: ServerConfig,
    extra: Vec<Arc<dyn Branch>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            extra: Vec::new(),
        }
    }

    /// Mount an additional branch next to the built-in ones.
    pub fn add_branch(mut self, branch: Arc<dyn Branch>) -> Self {
        self.extra.push(branch);
        self
    }

    /// Build the dispatcher with the built-in branches and wait until
    /// every branch reports ready.
    async fn build_state(self) -> Arc<SharedState> {
        let mut dispatcher = Dispatcher::new(self.config.root_name.clone());
        dispatcher.add_branch(Arc::new(SystemBranch::new()));
        dispatcher.add_branch(Arc::new(ExecBranch::from_config(&self.config)));
        dispatcher.add_branch(ChatBranch::new());
        for branch in self.extra {
            dispatcher.add_branch(branch);
        }
        let dispatcher = dispatcher.ready().await;
        Arc::new(SharedState {
            dispatcher,
            config: self.config,
        })
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr))?;
        tracing::info!("HTTP/WebSocket listener on {}", self.config.listen_addr);
        let state = self.build_state().await;
        serve(listener, state).await
    }

    /// Start the server and return the bound address, the shared state and
    /// the task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.build_state().await;
        let handle = tokio::spawn(serve(listener, state.clone()));
        Ok((addr, state, handle))
    }
}

async fn serve(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
    let app = crate::web::router(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("HTTP server error")
}
