use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

const CIDR: &str = "10.0.0.0/24";
const CALLER_IP: &str = "10.0.0.2";
const RECEIVER_IP: &str = "10.0.0.3";

/// A started virtual router with one interface per role, so both peers can run in one
/// process without touching OS networking.
pub struct VirtualNetwork {
    router: Arc<AsyncMutex<Router>>,
    caller: Arc<Net>,
    receiver: Arc<Net>,
}

impl VirtualNetwork {
    pub async fn start() -> Result<Self, webrtc::Error> {
        let router = Arc::new(AsyncMutex::new(Router::new(RouterConfig {
            cidr: CIDR.to_owned(),
            ..Default::default()
        })?));

        let caller = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec![CALLER_IP.to_owned()],
            ..Default::default()
        })));
        attach(&caller, &router).await?;

        let receiver = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec![RECEIVER_IP.to_owned()],
            ..Default::default()
        })));
        attach(&receiver, &router).await?;

        router.lock().await.start().await?;
        tracing::debug!(cidr = CIDR, "virtual network started");
        Ok(Self {
            router,
            caller,
            receiver,
        })
    }

    pub fn caller(&self) -> Arc<Net> {
        Arc::clone(&self.caller)
    }

    pub fn receiver(&self) -> Arc<Net> {
        Arc::clone(&self.receiver)
    }

    pub async fn stop(&self) {
        if let Err(err) = self.router.lock().await.stop().await {
            tracing::debug!(error = %err, "virtual router stop failed");
        }
    }
}

async fn attach(net: &Arc<Net>, router: &Arc<AsyncMutex<Router>>) -> Result<(), webrtc::Error> {
    let nic = net.get_nic()?;
    router.lock().await.add_net(Arc::clone(&nic)).await?;
    nic.lock().await.set_router(Arc::clone(router)).await?;
    Ok(())
}
