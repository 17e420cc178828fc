// 该文件是 Tianmu （天目） 项目的一部分。
// src/control.rs - 控制面
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 控制面
//!
//! 请求/应答式管理接口，经 NATS request-reply 暴露在
//! `tianmu.control` 主题上。请求为 `{"op": "...", ...}` JSON，
//! 应答统一 `{ok, code?, message?, data?}`。错误归类为
//! not_found / conflict / invalid_input / model_load / internal。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::manager::{ManagerError, StreamManager};
use crate::npu::NpuError;
use crate::registry::{ModelRegistry, RegistryError};
use crate::stream::StreamError;
use crate::types::{StreamConfig, StreamInfo};

/// 控制请求主题
pub const CONTROL_SUBJECT: &str = "tianmu.control";
/// 订阅轮询间隔，用于及时响应停止信号
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// 控制连接断开后的重试间隔
const RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// 流参数覆盖；省略的字段取默认值
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamTuning {
  pub width: Option<i32>,
  pub height: Option<i32>,
  pub fps: Option<i32>,
  pub confidence_threshold: Option<f32>,
}

impl StreamTuning {
  fn apply(&self, mut config: StreamConfig) -> StreamConfig {
    if let Some(width) = self.width {
      config.width = width;
    }
    if let Some(height) = self.height {
      config.height = height;
    }
    if let Some(fps) = self.fps {
      config.fps = fps;
    }
    if let Some(threshold) = self.confidence_threshold {
      config.confidence_threshold = threshold;
    }
    config
  }
}

/// 控制请求
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
  InstallModel {
    zip_base64: String,
    #[serde(default)]
    overwrite: bool,
  },
  UninstallModel {
    model_id: String,
  },
  AddStream {
    stream_id: String,
    source_url: String,
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    config: Option<StreamTuning>,
  },
  RemoveStream {
    stream_id: String,
  },
  UpdateInference {
    stream_id: String,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    config: Option<StreamTuning>,
  },
  ClearInference {
    stream_id: String,
  },
  GetStream {
    stream_id: String,
  },
  ListStreams {
    #[serde(default)]
    model_id: Option<String>,
  },
  ListModels,
  GetSnapshot {
    stream_id: String,
  },
  UpdateEventSettings {
    stream_id: String,
    settings: serde_json::Value,
  },
  ClearEventSettings {
    stream_id: String,
  },
}

/// 控制应答
#[derive(Debug, Serialize)]
pub struct ControlResponse {
  pub ok: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<serde_json::Value>,
}

impl ControlResponse {
  fn ok(data: serde_json::Value) -> Self {
    Self { ok: true, code: None, message: None, data: Some(data) }
  }

  fn ok_empty() -> Self {
    Self { ok: true, code: None, message: None, data: None }
  }

  fn error(code: &str, message: String) -> Self {
    Self { ok: false, code: Some(code.to_string()), message: Some(message), data: None }
  }
}

fn manager_error(e: ManagerError) -> ControlResponse {
  let code = match &e {
    ManagerError::NotFound(_) => "not_found",
    ManagerError::Conflict(_) => "conflict",
    ManagerError::Stream(StreamError::InvalidDescriptor(_)) => "invalid_input",
    ManagerError::Stream(StreamError::Model(NpuError::ModelLoad(_)))
    | ManagerError::Stream(StreamError::Model(NpuError::BackendUnavailable)) => "model_load",
    ManagerError::Stream(_) => "internal",
    ManagerError::Event(_) => "invalid_input",
  };
  ControlResponse::error(code, e.to_string())
}

fn registry_error(e: RegistryError) -> ControlResponse {
  let code = match &e {
    RegistryError::NotFound(_) => "not_found",
    RegistryError::AlreadyExists { .. } | RegistryError::InUse { .. } => "conflict",
    RegistryError::InvalidPackage(_) | RegistryError::InvalidConfig(_) => "invalid_input",
    RegistryError::Io(_) | RegistryError::Zip(_) => "internal",
  };
  ControlResponse::error(code, e.to_string())
}

/// 控制面服务：持有注册表与流管理器，按请求分发
pub struct ControlServer {
  manager: Arc<StreamManager>,
  registry: Arc<ModelRegistry>,
  nats_url: String,
  default_config: StreamConfig,
  running: Arc<AtomicBool>,
  thread: Mutex<Option<JoinHandle<()>>>,
}

impl ControlServer {
  pub fn new(
    manager: Arc<StreamManager>,
    registry: Arc<ModelRegistry>,
    nats_url: &str,
    default_config: StreamConfig,
  ) -> Arc<Self> {
    Arc::new(Self {
      manager,
      registry,
      nats_url: nats_url.to_string(),
      default_config,
      running: Arc::new(AtomicBool::new(false)),
      thread: Mutex::new(None),
    })
  }

  /// 启动服务线程：订阅控制主题并应答
  pub fn start(self: &Arc<Self>) {
    if self.running.swap(true, Ordering::SeqCst) {
      return;
    }

    let server = Arc::clone(self);
    let handle = thread::Builder::new()
      .name("control-server".to_string())
      .spawn(move || server.serve_loop())
      .ok();
    *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    info!("控制面已启动, 主题: {}", CONTROL_SUBJECT);
  }

  pub fn stop(&self) {
    if !self.running.swap(false, Ordering::SeqCst) {
      return;
    }
    let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(h) = handle {
      let _ = h.join();
    }
    info!("控制面已停止");
  }

  fn serve_loop(&self) {
    while self.running.load(Ordering::SeqCst) {
      let connection = match nats::connect(self.nats_url.as_str()) {
        Ok(c) => c,
        Err(e) => {
          warn!("控制面连接 NATS 失败: {}，{} 秒后重试", e, RETRY_INTERVAL.as_secs());
          self.sleep_interruptible(RETRY_INTERVAL);
          continue;
        }
      };

      let subscription = match connection.subscribe(CONTROL_SUBJECT) {
        Ok(s) => s,
        Err(e) => {
          warn!("控制面订阅失败: {}", e);
          self.sleep_interruptible(RETRY_INTERVAL);
          continue;
        }
      };

      info!("控制面在线: {}", self.nats_url);

      while self.running.load(Ordering::SeqCst) {
        match subscription.next_timeout(POLL_INTERVAL) {
          Ok(message) => {
            let response = self.handle_raw(&message.data);
            if let Err(e) = message.respond(&response) {
              warn!("控制应答发送失败: {}", e);
            }
          }
          Err(_) => {
            // 超时轮询，顺带检查停止信号
          }
        }
      }
    }
  }

  fn sleep_interruptible(&self, duration: Duration) {
    let deadline = std::time::Instant::now() + duration;
    while self.running.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
      thread::sleep(Duration::from_millis(100));
    }
  }

  /// 解析原始请求并分发，始终返回 JSON 应答字节
  pub fn handle_raw(&self, payload: &[u8]) -> Vec<u8> {
    let response = match serde_json::from_slice::<ControlRequest>(payload) {
      Ok(request) => self.handle_request(request),
      Err(e) => ControlResponse::error("invalid_input", format!("请求解析失败: {}", e)),
    };
    serde_json::to_vec(&response).unwrap_or_else(|_| b"{\"ok\":false}".to_vec())
  }

  pub fn handle_request(&self, request: ControlRequest) -> ControlResponse {
    match request {
      ControlRequest::InstallModel { zip_base64, overwrite } => {
        let zip_data = match base64::engine::general_purpose::STANDARD.decode(&zip_base64) {
          Ok(data) => data,
          Err(e) => {
            return ControlResponse::error("invalid_input", format!("ZIP Base64 解码失败: {}", e));
          }
        };

        match self.registry.install_model(&zip_data, overwrite) {
          Ok(model_id) => ControlResponse::ok(serde_json::json!({ "model_id": model_id })),
          Err(e) => registry_error(e),
        }
      }

      ControlRequest::UninstallModel { model_id } => {
        if model_id.is_empty() {
          return ControlResponse::error("invalid_input", "model_id 不能为空".to_string());
        }

        let hef_path = self.registry.get_model(&model_id).map(|m| m.hef_path);

        // 先把使用该模型的流切到纯视频模式
        for stream_id in self.manager.streams_using_model(&model_id) {
          if let Err(e) = self.manager.clear_stream_inference(&stream_id) {
            warn!("流 {} 卸下模型失败: {}", stream_id, e);
          }
          self.registry.decrement_usage(&model_id);
        }

        if let Some(path) = hef_path {
          self.manager.engine().release(&path);
        }

        match self.registry.uninstall_model(&model_id, true) {
          Ok(()) => ControlResponse::ok_empty(),
          Err(e) => registry_error(e),
        }
      }

      ControlRequest::AddStream { stream_id, source_url, model_id, config } => {
        if stream_id.is_empty() {
          return ControlResponse::error("invalid_input", "stream_id 不能为空".to_string());
        }
        if source_url.is_empty() {
          return ControlResponse::error("invalid_input", "source_url 不能为空".to_string());
        }

        let info = match self.resolve_stream_info(&stream_id, &source_url, &model_id, &config) {
          Ok(info) => info,
          Err(response) => return response,
        };

        let used_model = info.model_id.clone();
        match self.manager.add_stream(info) {
          Ok(state) => {
            if !used_model.is_empty() {
              self.registry.increment_usage(&used_model);
            }
            ControlResponse::ok(serde_json::json!({ "state": state.as_str() }))
          }
          Err(e) => manager_error(e),
        }
      }

      ControlRequest::RemoveStream { stream_id } => {
        let old_model = self
          .manager
          .stream_status(&stream_id)
          .map(|s| s.model_id)
          .unwrap_or_default();

        match self.manager.remove_stream(&stream_id) {
          Ok(()) => {
            if !old_model.is_empty() {
              self.registry.decrement_usage(&old_model);
            }
            ControlResponse::ok_empty()
          }
          Err(e) => manager_error(e),
        }
      }

      ControlRequest::UpdateInference { stream_id, source_url, model_id, config } => {
        let old_status = match self.manager.stream_status(&stream_id) {
          Some(status) => status,
          None => {
            return ControlResponse::error("not_found", format!("流 {} 不存在", stream_id));
          }
        };

        let source = source_url.unwrap_or_else(|| old_status.source_url.clone());
        let info = match self.resolve_stream_info(&stream_id, &source, &model_id, &config) {
          Ok(info) => info,
          Err(response) => return response,
        };

        let new_model = info.model_id.clone();
        match self.manager.update_stream(info) {
          Ok(()) => {
            if new_model != old_status.model_id {
              if !old_status.model_id.is_empty() {
                self.registry.decrement_usage(&old_status.model_id);
              }
              if !new_model.is_empty() {
                self.registry.increment_usage(&new_model);
              }
            }
            ControlResponse::ok_empty()
          }
          Err(e) => manager_error(e),
        }
      }

      ControlRequest::ClearInference { stream_id } => {
        let old_model = self
          .manager
          .stream_status(&stream_id)
          .map(|s| s.model_id)
          .unwrap_or_default();

        match self.manager.clear_stream_inference(&stream_id) {
          Ok(()) => {
            if !old_model.is_empty() {
              self.registry.decrement_usage(&old_model);
            }
            ControlResponse::ok_empty()
          }
          Err(e) => manager_error(e),
        }
      }

      ControlRequest::GetStream { stream_id } => match self.manager.stream_status(&stream_id) {
        Some(status) => match serde_json::to_value(&status) {
          Ok(value) => ControlResponse::ok(value),
          Err(e) => ControlResponse::error("internal", e.to_string()),
        },
        None => ControlResponse::error("not_found", format!("流 {} 不存在", stream_id)),
      },

      ControlRequest::ListStreams { model_id } => {
        let statuses: Vec<_> = self
          .manager
          .all_stream_status()
          .into_iter()
          .filter(|s| model_id.as_deref().map(|m| s.model_id == m).unwrap_or(true))
          .collect();

        match serde_json::to_value(&statuses) {
          Ok(value) => ControlResponse::ok(serde_json::json!({ "streams": value })),
          Err(e) => ControlResponse::error("internal", e.to_string()),
        }
      }

      ControlRequest::ListModels => {
        let models: Vec<serde_json::Value> = self
          .registry
          .all_models()
          .into_iter()
          .map(|m| {
            serde_json::json!({
              "id": m.model_id,
              "name": m.name,
              "version": m.version,
              "task": m.task,
              "labels": m.labels,
              "num_keypoints": m.num_keypoints,
              "description": m.description,
              "registered_at": m.registered_at,
              "usage_count": m.usage_count,
            })
          })
          .collect();
        ControlResponse::ok(serde_json::json!({ "models": models }))
      }

      ControlRequest::GetSnapshot { stream_id } => {
        let image = self
          .manager
          .snapshot(&stream_id)
          .map(|jpeg| base64::engine::general_purpose::STANDARD.encode(jpeg));
        ControlResponse::ok(serde_json::json!({ "image": image }))
      }

      ControlRequest::UpdateEventSettings { stream_id, settings } => {
        let settings_json = settings.to_string();
        match self.manager.update_event_settings(&stream_id, &settings_json) {
          Ok(terminals) => {
            ControlResponse::ok(serde_json::json!({ "terminal_rule_ids": terminals }))
          }
          Err(e) => manager_error(e),
        }
      }

      ControlRequest::ClearEventSettings { stream_id } => {
        match self.manager.clear_event_settings(&stream_id) {
          Ok(()) => ControlResponse::ok_empty(),
          Err(e) => manager_error(e),
        }
      }
    }
  }

  /// 组装流描述符：model_id 解析为模型包的路径与标注配置
  fn resolve_stream_info(
    &self,
    stream_id: &str,
    source_url: &str,
    model_id: &Option<String>,
    tuning: &Option<StreamTuning>,
  ) -> Result<StreamInfo, ControlResponse> {
    let config = tuning
      .as_ref()
      .map(|t| t.apply(self.default_config.clone()))
      .unwrap_or_else(|| self.default_config.clone());

    let mut info = StreamInfo {
      stream_id: stream_id.to_string(),
      source_url: source_url.to_string(),
      config,
      ..Default::default()
    };

    if let Some(model_id) = model_id.as_deref().filter(|m| !m.is_empty()) {
      let model = self.registry.get_model(model_id).ok_or_else(|| {
        ControlResponse::error("not_found", format!("模型 {} 不存在", model_id))
      })?;

      info.model_id = model.model_id;
      info.model_path = model.hef_path;
      info.task = model.task;
      info.num_keypoints = model.num_keypoints;
      info.labels = model.labels;
    }

    Ok(info)
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use super::*;
  use crate::manager::ProcessorFactory;
  use crate::npu::NpuEngine;
  use crate::publisher::NatsPublisher;
  use crate::stream::mock::MockStreamProcessor;
  use crate::stream::StreamProcessor;

  fn make_server() -> (Arc<ControlServer>, Arc<StreamManager>, Arc<ModelRegistry>, tempfile::TempDir) {
    let factory: ProcessorFactory = Box::new(|info| {
      Ok(Arc::new(MockStreamProcessor::new(info)) as Arc<dyn StreamProcessor>)
    });

    let publisher = NatsPublisher::new("nats://127.0.0.1:4222", 5, 0);
    let engine = NpuEngine::new();
    let manager = StreamManager::with_factory(publisher, engine, 2, factory);

    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ModelRegistry::new(dir.path()));
    registry.initialize().unwrap();

    let server = ControlServer::new(
      Arc::clone(&manager),
      Arc::clone(&registry),
      "nats://127.0.0.1:4222",
      StreamConfig::default(),
    );
    (server, manager, registry, dir)
  }

  fn model_zip(id: &str) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
      let mut writer = zip::ZipWriter::new(&mut cursor);
      let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
      writer.start_file("model.hef", options).unwrap();
      writer.write_all(b"fake-hef").unwrap();
      writer.start_file("model_config.json", options).unwrap();
      writer
        .write_all(format!(r#"{{"id": "{}", "task": "det", "labels": ["person"]}}"#, id).as_bytes())
        .unwrap();
      writer.finish().unwrap();
    }
    cursor.into_inner()
  }

  fn install_model(server: &ControlServer, id: &str) {
    let zip = model_zip(id);
    let response = server.handle_request(ControlRequest::InstallModel {
      zip_base64: base64::engine::general_purpose::STANDARD.encode(zip),
      overwrite: false,
    });
    assert!(response.ok, "安装失败: {:?}", response.message);
  }

  #[test]
  fn test_add_stream_video_only() {
    let (server, manager, _registry, _dir) = make_server();

    let response = server.handle_request(ControlRequest::AddStream {
      stream_id: "cam-1".to_string(),
      source_url: "rtsp://10.0.0.1/live".to_string(),
      model_id: None,
      config: None,
    });

    assert!(response.ok);
    assert_eq!(response.data.unwrap()["state"], "RUNNING");
    assert!(manager.has_stream("cam-1"));
  }

  #[test]
  fn test_add_stream_with_model_tracks_usage() {
    let (server, _manager, registry, _dir) = make_server();
    install_model(&server, "m1");

    let response = server.handle_request(ControlRequest::AddStream {
      stream_id: "cam-1".to_string(),
      source_url: "rtsp://10.0.0.1/live".to_string(),
      model_id: Some("m1".to_string()),
      config: None,
    });
    assert!(response.ok);
    assert_eq!(registry.get_model("m1").unwrap().usage_count, 1);

    let response = server.handle_request(ControlRequest::RemoveStream {
      stream_id: "cam-1".to_string(),
    });
    assert!(response.ok);
    assert_eq!(registry.get_model("m1").unwrap().usage_count, 0);
  }

  #[test]
  fn test_add_stream_unknown_model() {
    let (server, _manager, _registry, _dir) = make_server();

    let response = server.handle_request(ControlRequest::AddStream {
      stream_id: "cam-1".to_string(),
      source_url: "rtsp://10.0.0.1/live".to_string(),
      model_id: Some("ghost".to_string()),
      config: None,
    });

    assert!(!response.ok);
    assert_eq!(response.code.as_deref(), Some("not_found"));
  }

  #[test]
  fn test_add_stream_capacity_conflict() {
    let (server, _manager, _registry, _dir) = make_server();

    for i in 1..=2 {
      let response = server.handle_request(ControlRequest::AddStream {
        stream_id: format!("cam-{}", i),
        source_url: "rtsp://10.0.0.1/live".to_string(),
        model_id: None,
        config: None,
      });
      assert!(response.ok);
    }

    // 超出 max_streams 的那条返回 conflict
    let response = server.handle_request(ControlRequest::AddStream {
      stream_id: "cam-3".to_string(),
      source_url: "rtsp://10.0.0.1/live".to_string(),
      model_id: None,
      config: None,
    });
    assert!(!response.ok);
    assert_eq!(response.code.as_deref(), Some("conflict"));
  }

  #[test]
  fn test_empty_stream_id_invalid() {
    let (server, _manager, _registry, _dir) = make_server();

    let response = server.handle_request(ControlRequest::AddStream {
      stream_id: String::new(),
      source_url: "rtsp://10.0.0.1/live".to_string(),
      model_id: None,
      config: None,
    });
    assert!(!response.ok);
    assert_eq!(response.code.as_deref(), Some("invalid_input"));
  }

  #[test]
  fn test_install_and_uninstall_model() {
    let (server, _manager, registry, _dir) = make_server();
    install_model(&server, "m1");
    assert!(registry.has_model("m1"));

    let response = server.handle_request(ControlRequest::UninstallModel {
      model_id: "m1".to_string(),
    });
    assert!(response.ok);
    assert!(!registry.has_model("m1"));
  }

  #[test]
  fn test_uninstall_clears_streams_using_model() {
    let (server, manager, registry, _dir) = make_server();
    install_model(&server, "m1");

    server.handle_request(ControlRequest::AddStream {
      stream_id: "cam-1".to_string(),
      source_url: "rtsp://10.0.0.1/live".to_string(),
      model_id: Some("m1".to_string()),
      config: None,
    });

    let response = server.handle_request(ControlRequest::UninstallModel {
      model_id: "m1".to_string(),
    });
    assert!(response.ok);
    assert!(!registry.has_model("m1"));

    // 流仍在运行，但已切到纯视频模式
    let status = manager.stream_status("cam-1").unwrap();
    assert!(status.model_id.is_empty());
  }

  #[test]
  fn test_clear_inference_decrements_usage() {
    let (server, _manager, registry, _dir) = make_server();
    install_model(&server, "m1");

    server.handle_request(ControlRequest::AddStream {
      stream_id: "cam-1".to_string(),
      source_url: "rtsp://10.0.0.1/live".to_string(),
      model_id: Some("m1".to_string()),
      config: None,
    });

    let response = server.handle_request(ControlRequest::ClearInference {
      stream_id: "cam-1".to_string(),
    });
    assert!(response.ok);
    assert_eq!(registry.get_model("m1").unwrap().usage_count, 0);
  }

  #[test]
  fn test_get_and_list_streams() {
    let (server, _manager, _registry, _dir) = make_server();

    server.handle_request(ControlRequest::AddStream {
      stream_id: "cam-1".to_string(),
      source_url: "rtsp://10.0.0.1/live".to_string(),
      model_id: None,
      config: None,
    });

    let response = server.handle_request(ControlRequest::GetStream {
      stream_id: "cam-1".to_string(),
    });
    assert!(response.ok);
    assert_eq!(response.data.unwrap()["stream_id"], "cam-1");

    let response = server.handle_request(ControlRequest::GetStream {
      stream_id: "ghost".to_string(),
    });
    assert_eq!(response.code.as_deref(), Some("not_found"));

    let response = server.handle_request(ControlRequest::ListStreams { model_id: None });
    assert_eq!(response.data.unwrap()["streams"].as_array().unwrap().len(), 1);

    let response = server.handle_request(ControlRequest::ListStreams {
      model_id: Some("ghost".to_string()),
    });
    assert!(response.data.unwrap()["streams"].as_array().unwrap().is_empty());
  }

  #[test]
  fn test_snapshot_none_for_missing_stream() {
    let (server, _manager, _registry, _dir) = make_server();

    let response = server.handle_request(ControlRequest::GetSnapshot {
      stream_id: "ghost".to_string(),
    });
    assert!(response.ok);
    assert!(response.data.unwrap()["image"].is_null());
  }

  #[test]
  fn test_event_settings_round_trip() {
    let (server, _manager, _registry, _dir) = make_server();

    server.handle_request(ControlRequest::AddStream {
      stream_id: "cam-1".to_string(),
      source_url: "rtsp://10.0.0.1/live".to_string(),
      model_id: None,
      config: None,
    });

    let settings: serde_json::Value = serde_json::from_str(
      r#"{"configs": [{"eventSettingId": "roi-1", "eventType": "ROI",
          "points": [[0.1, 0.1], [0.9, 0.1], [0.9, 0.9]]}]}"#,
    )
    .unwrap();

    let response = server.handle_request(ControlRequest::UpdateEventSettings {
      stream_id: "cam-1".to_string(),
      settings,
    });
    assert!(response.ok);
    assert_eq!(
      response.data.unwrap()["terminal_rule_ids"],
      serde_json::json!(["roi-1"])
    );

    let response = server.handle_request(ControlRequest::ClearEventSettings {
      stream_id: "cam-1".to_string(),
    });
    assert!(response.ok);
  }

  #[test]
  fn test_handle_raw_invalid_json() {
    let (server, _manager, _registry, _dir) = make_server();

    let response_bytes = server.handle_raw(b"not json");
    let response: serde_json::Value = serde_json::from_slice(&response_bytes).unwrap();
    assert_eq!(response["ok"], false);
    assert_eq!(response["code"], "invalid_input");
  }

  #[test]
  fn test_handle_raw_dispatch() {
    let (server, _manager, _registry, _dir) = make_server();

    let request = br#"{"op": "add_stream", "stream_id": "cam-1", "source_url": "rtsp://10.0.0.1/live"}"#;
    let response: serde_json::Value = serde_json::from_slice(&server.handle_raw(request)).unwrap();
    assert_eq!(response["ok"], true);
    assert_eq!(response["data"]["state"], "RUNNING");
  }
}
