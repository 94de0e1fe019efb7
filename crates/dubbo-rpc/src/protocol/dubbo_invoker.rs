use async_trait::async_trait;
use dubbo_proto::{Package, RequestPayload, Service, Value};
use dubbo_remoting::ExchangeClient;
use tracing::debug;

use crate::error::RpcError;
use crate::invocation::{CallMode, Invocation};
use crate::invoker::{BaseInvoker, Invoker};
use crate::result::RpcResult;
use crate::url::Url;

/// Terminal consumer invoker that sends calls over one exchange client.
pub struct DubboInvoker {
    base: BaseInvoker,
    client: ExchangeClient,
}

impl DubboInvoker {
    #[must_use]
    pub const fn new(url: Url, client: ExchangeClient) -> Self {
        Self {
            base: BaseInvoker::new(url),
            client,
        }
    }

    #[must_use]
    pub const fn client(&self) -> &ExchangeClient {
        &self.client
    }

    fn package(&self, invocation: &Invocation) -> Package {
        let url = self.base.url();
        let path = match url.path().trim_start_matches('/') {
            "" => url.interface(),
            path => path,
        };
        Package::request(
            Service {
                path: path.to_owned(),
                interface: url.interface().to_owned(),
                group: url.group().to_owned(),
                version: url.version().to_owned(),
                method: invocation.method().to_owned(),
                timeout: url.method_timeout(invocation.method()),
            },
            RequestPayload {
                args: invocation.args().to_vec(),
                arg_types: invocation.explicit_arg_types().map(str::to_owned),
                attachments: invocation.attachments().clone(),
            },
        )
    }
}

#[async_trait]
impl Invoker for DubboInvoker {
    fn url(&self) -> &Url {
        self.base.url()
    }

    fn is_available(&self) -> bool {
        self.base.is_available() && self.client.is_available()
    }

    async fn invoke(&self, invocation: &mut Invocation) -> RpcResult {
        if self.base.is_destroyed() {
            return RpcResult::err(RpcError::Unavailable(self.base.url().key()));
        }

        let package = self.package(invocation);
        let timeout = self.base.url().method_timeout(invocation.method());
        let reply = invocation.reply().clone();
        debug!(url = %self.base.url().key(), method = %invocation.method(), mode = ?invocation.mode(), "invoking");

        match invocation.mode().clone() {
            CallMode::Sync => match self.client.request(package, reply, timeout).await {
                Ok(payload) => RpcResult::from_payload(payload),
                Err(e) => RpcResult::err(e.into()),
            },
            CallMode::Async(callback) => {
                let sent = self
                    .client
                    .request_async(
                        package,
                        reply,
                        timeout,
                        Box::new(move |response| {
                            callback(match response.result {
                                Ok(payload) => RpcResult::from_payload(payload),
                                Err(e) => RpcResult::err(e.into()),
                            });
                        }),
                    )
                    .await;
                match sent {
                    Ok(_) => RpcResult::ok(Value::Null),
                    Err(e) => RpcResult::err(e.into()),
                }
            }
            CallMode::Oneway => match self.client.send_oneway(package).await {
                Ok(()) => RpcResult::ok(Value::Null),
                Err(e) => RpcResult::err(e.into()),
            },
        }
    }

    fn destroy(&self) {
        if self.base.destroy() {
            self.client.close();
        }
    }
}
