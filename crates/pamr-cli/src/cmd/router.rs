//! `pamr router`.

use super::{fail, runtime};
use pamr_router::Router;
use pamr_types::config::PamrConfig;
use tracing::info;

pub fn cmd_router(config: PamrConfig, listen: Option<String>) {
    let mut router_config = config.router;
    if let Some(listen) = listen {
        router_config.listen_addr = listen;
    }

    let rt = runtime();
    rt.block_on(async move {
        let (router, handle) = Router::start(router_config)
            .await
            .unwrap_or_else(|e| fail(e));
        println!("Router listening on {}", router.local_addr());

        if let Err(e) = tokio::signal::ctrl_c().await {
            fail(format!("cannot wait for Ctrl+C: {e}"));
        }
        info!(agents = router.table().len(), "Interrupted, stopping router");
        router.shutdown();
        let _ = handle.await;
    });
}
