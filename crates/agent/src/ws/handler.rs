/// RPC 请求处理
///
/// 按方法名把 Server 的请求分发到 `DomainBackend`，结果或错误写回响应

use common::ws_rpc::{
    methods, DefineDomainRequest, DeviceRequest, DomainRequest, Empty, ExistsResponse,
    LiveMigrateRequest, PowerResponse, SetPasswordRequest, StatsResponse, StatusResponse,
    XmlDescRequest, XmlDescResponse,
};
use common::{RpcError, RpcMessage};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::hypervisor::DomainBackend;

fn params<T: DeserializeOwned>(payload: Value) -> Result<T, RpcError> {
    serde_json::from_value(payload).map_err(|e| RpcError::invalid_params(format!("参数解析失败: {}", e)))
}

fn reply<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(RpcError::from)
}

/// RPC 处理器
#[derive(Clone)]
pub struct RpcHandler {
    backend: Arc<dyn DomainBackend>,
}

impl RpcHandler {
    pub fn new(backend: Arc<dyn DomainBackend>) -> Self {
        Self { backend }
    }

    /// 处理请求，始终返回一条与请求 ID 对应的响应
    pub async fn handle_request(&self, msg: RpcMessage) -> RpcMessage {
        let Some(method) = msg.method else {
            return RpcMessage::error_response(msg.id, &RpcError::invalid_request("请求缺少方法名"));
        };
        debug!("处理请求: id={}, method={}", msg.id, method);

        let payload = msg.payload.unwrap_or(Value::Null);
        match self.dispatch(&method, payload).await {
            Ok(result) => RpcMessage::response(msg.id, result),
            Err(e) => {
                warn!("请求处理失败: method={}, error={}", method, e);
                RpcMessage::error_response(msg.id, &e)
            }
        }
    }

    async fn dispatch(&self, method: &str, payload: Value) -> Result<Value, RpcError> {
        let hv = &self.backend;
        match method {
            methods::PING => {
                hv.ping().await?;
                reply(&Empty {})
            }
            methods::DEFINE_DOMAIN => {
                let req: DefineDomainRequest = params(payload)?;
                reply(&hv.define(&req.xml).await?)
            }
            methods::UNDEFINE_DOMAIN => {
                let req: DomainRequest = params(payload)?;
                hv.undefine(&req.uuid).await?;
                reply(&Empty {})
            }
            methods::START_DOMAIN
            | methods::REBOOT_DOMAIN
            | methods::SHUTDOWN_DOMAIN
            | methods::POWEROFF_DOMAIN => {
                let req: DomainRequest = params(payload)?;
                let changed = match method {
                    methods::START_DOMAIN => hv.start(&req.uuid).await?,
                    methods::REBOOT_DOMAIN => hv.reboot(&req.uuid).await?,
                    methods::SHUTDOWN_DOMAIN => hv.shutdown(&req.uuid).await?,
                    _ => hv.poweroff(&req.uuid).await?,
                };
                reply(&PowerResponse { changed })
            }
            methods::DOMAIN_STATUS => {
                let req: DomainRequest = params(payload)?;
                let state = hv.status(&req.uuid).await?;
                reply(&StatusResponse { state })
            }
            methods::DOMAIN_EXISTS => {
                let req: DomainRequest = params(payload)?;
                let exists = hv.exists(&req.uuid).await?;
                reply(&ExistsResponse { exists })
            }
            methods::ATTACH_DEVICE => {
                let req: DeviceRequest = params(payload)?;
                hv.attach_device(&req.uuid, &req.xml).await?;
                reply(&Empty {})
            }
            methods::DETACH_DEVICE => {
                let req: DeviceRequest = params(payload)?;
                hv.detach_device(&req.uuid, &req.xml).await?;
                reply(&Empty {})
            }
            methods::XML_DESC => {
                let req: XmlDescRequest = params(payload)?;
                let xml = hv.xml_desc(&req.uuid, req.live).await?;
                reply(&XmlDescResponse { xml })
            }
            methods::DOMAIN_STATS => {
                let req: DomainRequest = params(payload)?;
                let stats = hv.stats(&req.uuid).await?;
                reply(&StatsResponse { stats })
            }
            methods::LIVE_MIGRATE => {
                let req: LiveMigrateRequest = params(payload)?;
                reply(&hv.live_migrate(&req.uuid, &req.dest_ip).await?)
            }
            methods::SET_USER_PASSWORD => {
                let req: SetPasswordRequest = params(payload)?;
                hv.set_user_password(&req.uuid, &req.user, &req.password).await?;
                reply(&Empty {})
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}
