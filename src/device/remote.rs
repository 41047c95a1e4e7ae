//! 远程执行器：通过 HTTP/JSON 守护进程驱动设备
//!
//! 每个请求最多重试 `retry` 次，非 200 状态即重试，耗尽后返回 Transport 错误。
//! 启动 / 重启 / 关闭使用较长的超时，动作 / 观测 / adb 透传使用每步超时。
//! 会话靠 cookie 维持，因此整个执行器共用一个 `reqwest::Client`。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::RemoteConfig;
use crate::core::EnvError;
use crate::device::{Action, Actuator, ControlChannel, LogStream, Observation, Screenshot};

/// 带重试的请求 / 响应通道
pub struct RemoteTransport {
    client: Client,
    url_base: String,
    timeout: Duration,
    launch_timeout: Duration,
    retry: u32,
}

impl RemoteTransport {
    pub fn new(url_base: impl Into<String>, timeout: Duration, launch_timeout: Duration, retry: u32) -> Result<Self, EnvError> {
        let client = Client::builder()
            .cookie_store(true)
            .connect_timeout(timeout)
            .build()?;
        let mut url_base = url_base.into();
        if !url_base.ends_with('/') {
            url_base.push('/');
        }
        Ok(Self {
            client,
            url_base,
            timeout,
            launch_timeout,
            retry: retry.max(1),
        })
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self, EnvError> {
        Self::new(
            format!("http://{}:{}/", config.address, config.port),
            Duration::from_secs_f64(config.timeout_secs),
            Duration::from_secs_f64(config.launch_timeout_secs),
            config.retry,
        )
    }

    pub fn url_base(&self) -> &str {
        &self.url_base
    }

    /// `timeout` 为 None 时不限制整体耗时（用于日志流）
    async fn request(
        &self,
        method: Method,
        action: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<Response, EnvError> {
        let url = format!("{}{}", self.url_base, action);
        let mut last_failure = String::new();
        for attempt in 1..=self.retry {
            let start = Instant::now();
            let mut builder = self.client.request(method.clone(), &url);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            if let Some(timeout) = timeout {
                builder = builder.timeout(timeout);
            }
            let result = builder.send().await;

            let status = match &result {
                Ok(resp) => resp.status().as_u16().to_string(),
                Err(e) if e.is_timeout() => "timeout".to_string(),
                Err(_) => "error".to_string(),
            };
            let audit = json!({
                "event": "remote_audit",
                "action": action,
                "attempt": attempt,
                "status": status,
                "duration_ms": start.elapsed().as_millis() as u64,
            });
            tracing::info!(audit = %audit.to_string(), "remote");

            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    tracing::debug!(attempt, status = %resp.status(), action, "remote response error");
                    last_failure = format!("status {}", resp.status());
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, action, "remote request failed");
                    last_failure = e.to_string();
                }
            }
        }
        Err(EnvError::Transport(format!(
            "{action} failed after {} attempts: {last_failure}",
            self.retry
        )))
    }

    /// 长耗时调用（init / launch / restart / close），不带请求体
    pub async fn call_long(&self, action: &str) -> Result<(), EnvError> {
        self.request(Method::POST, action, None, Some(self.launch_timeout))
            .await
            .map(|_| ())
    }

    /// 每步调用，忽略响应体
    pub async fn call(&self, action: &str, body: &Value) -> Result<(), EnvError> {
        self.request(Method::POST, action, Some(body), Some(self.timeout))
            .await
            .map(|_| ())
    }

    /// 每步调用，解析 JSON 响应
    pub async fn call_json<T: DeserializeOwned>(&self, action: &str, body: &Value) -> Result<T, EnvError> {
        let resp = self
            .request(Method::POST, action, Some(body), Some(self.timeout))
            .await?;
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| EnvError::MalformedResponse(format!("{action}: {e}")))
    }

    /// 长连接 GET，返回字节流
    pub async fn open_stream(&self, action: &str) -> Result<BoxStream<'static, reqwest::Result<Bytes>>, EnvError> {
        let resp = self.request(Method::GET, action, None, None).await?;
        Ok(resp.bytes_stream().boxed())
    }
}

#[derive(Debug, Deserialize)]
struct ObservResponse {
    img: String,
    size: [u32; 2],
    time: i64,
}

#[derive(Debug, Deserialize)]
struct AdbcResponse {
    name: String,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct AdbResponse {
    output: Option<String>,
}

fn decode_base64(field: &str, data: &str) -> Result<Vec<u8>, EnvError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| EnvError::MalformedResponse(format!("{field} is not valid base64: {e}")))
}

/// 远程守护进程背后的设备
pub struct RemoteActuator {
    transport: Arc<RemoteTransport>,
    resize_to: Option<[u32; 2]>,
    initialized: AtomicBool,
    launched_at: Mutex<Option<Instant>>,
}

impl RemoteActuator {
    pub fn new(transport: Arc<RemoteTransport>, resize_to: Option<[u32; 2]>) -> Self {
        Self {
            transport,
            resize_to,
            initialized: AtomicBool::new(false),
            launched_at: Mutex::new(None),
        }
    }

    fn launched_at(&self) -> Option<Instant> {
        *self.launched_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_launched_at(&self, at: Option<Instant>) {
        *self.launched_at.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

#[async_trait]
impl Actuator for RemoteActuator {
    async fn launch(&self) -> Result<(), EnvError> {
        if !self.initialized.load(Ordering::SeqCst) {
            self.transport.call_long("init").await?;
            self.initialized.store(true, Ordering::SeqCst);
        }
        if self.is_launched() {
            tracing::info!("Restarting remote device");
            self.transport.call_long("restart").await?;
        } else {
            tracing::info!("Launching remote device");
            self.transport.call_long("launch").await?;
        }
        self.set_launched_at(Some(Instant::now()));
        Ok(())
    }

    fn is_launched(&self) -> bool {
        self.launched_at().is_some()
    }

    async fn send_action(&self, actions: &[Action]) -> Result<(), EnvError> {
        let body = serde_json::to_value(actions).map_err(|e| EnvError::MalformedResponse(e.to_string()))?;
        self.transport.call("act", &body).await
    }

    async fn get_observation(&self) -> Result<Observation, EnvError> {
        let body = match self.resize_to {
            Some(size) => json!({ "resize_to": size }),
            None => json!({}),
        };
        let resp: ObservResponse = self.transport.call_json("observ", &body).await?;
        let data = decode_base64("img", &resp.img)?;
        let [width, height] = resp.size;
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(EnvError::MalformedResponse(format!(
                "observation has {} bytes, expected {expected} for {width}x{height} rgb",
                data.len()
            )));
        }
        Ok(Observation {
            pixels: Arc::new(Screenshot::new(width, height, data)),
            timestamp: resp.time,
            view_hierarchy: None,
        })
    }

    async fn get_log_stream(&self) -> Result<Box<dyn LogStream>, EnvError> {
        let stream = self.transport.open_stream("create_logs").await?;
        Ok(Box::new(RemoteLogStream::new(Arc::clone(&self.transport), stream)))
    }

    async fn create_control_channel(&self) -> Result<Arc<dyn ControlChannel>, EnvError> {
        let resp: AdbcResponse = self.transport.call_json("create_adbc", &json!({})).await?;
        tracing::info!(device = %resp.name, id = resp.id, "Control channel created");
        Ok(Arc::new(RemoteControlChannel {
            transport: Arc::clone(&self.transport),
            id: resp.id,
            device_name: resp.name,
        }))
    }

    async fn close(&self) -> Result<(), EnvError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.transport.call_long("close").await?;
        self.set_launched_at(None);
        Ok(())
    }

    fn uptime(&self) -> Option<Duration> {
        self.launched_at().map(|t| t.elapsed())
    }
}

/// adb 透传控制通道
pub struct RemoteControlChannel {
    transport: Arc<RemoteTransport>,
    id: u64,
    device_name: String,
}

impl RemoteControlChannel {
    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

#[async_trait]
impl ControlChannel for RemoteControlChannel {
    async fn execute(&self, args: &[String], timeout: Duration) -> Result<Option<String>, EnvError> {
        let body = json!({
            "id": self.id,
            "cmd": args,
            "timeout": timeout.as_secs_f64(),
        });
        let resp: AdbResponse = self.transport.call_json("adb", &body).await?;
        resp.output
            .map(|b64| decode_base64("output", &b64).map(|raw| String::from_utf8_lossy(&raw).into_owned()))
            .transpose()
    }
}

/// 逐行解码的远程日志流
pub struct RemoteLogStream {
    transport: Arc<RemoteTransport>,
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: BytesMut,
    finished: bool,
}

impl RemoteLogStream {
    pub fn new(transport: Arc<RemoteTransport>, stream: BoxStream<'static, reqwest::Result<Bytes>>) -> Self {
        Self {
            transport,
            stream,
            buffer: BytesMut::new(),
            finished: false,
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let line = self.buffer.split_to(pos + 1);
        Some(decode_line(&line))
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

#[async_trait]
impl LogStream for RemoteLogStream {
    async fn next_line(&mut self) -> Result<Option<String>, EnvError> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let rest = self.buffer.split();
                return Ok(Some(decode_line(&rest)));
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e.into()),
                None => self.finished = true,
            }
        }
    }

    async fn set_filters(&mut self, filters: &[String]) -> Result<(), EnvError> {
        self.transport.call("set_filts", &json!({ "filts": filters })).await
    }
}
