// 该文件是 Tianmu （天目） 项目的一部分。
// src/publisher.rs - 消息总线发布器
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 消息总线发布器
//!
//! 每帧结果信封以 JSON 发布到 `stream.{stream_id}` 主题。
//! 发布是 fire-and-forget：总线断开时静默跳过，绝不阻塞帧循环；
//! 后台重连线程以固定间隔重试。

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{now_timestamp_ms, DetectionEvent};

#[derive(Error, Debug)]
pub enum PublishError {
  #[error("NATS 连接失败: {0}")]
  Connect(String),
  #[error("发布失败: {0}")]
  Publish(String),
  #[error("结果序列化失败: {0}")]
  Serialize(#[from] serde_json::Error),
}

/// 消息发布抽象；测试用模拟实现替换真实总线
pub trait MessagePublisher: Send + Sync {
  fn connect(&self) -> Result<(), PublishError>;
  fn disconnect(&self);
  fn is_connected(&self) -> bool;
  fn publish(&self, event: &DetectionEvent) -> Result<(), PublishError>;
  fn publish_raw(&self, subject: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// 总线连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatsState {
  Disconnected,
  Connecting,
  Connected,
  Reconnecting,
}

impl NatsState {
  pub fn as_str(&self) -> &'static str {
    match self {
      NatsState::Disconnected => "DISCONNECTED",
      NatsState::Connecting => "CONNECTING",
      NatsState::Connected => "CONNECTED",
      NatsState::Reconnecting => "RECONNECTING",
    }
  }
}

/// 发布统计
#[derive(Debug, Clone, Default)]
pub struct NatsStats {
  pub messages_published: u64,
  pub last_publish_time: i64,
  pub reconnect_attempts: u32,
  pub last_error: String,
}

/// NATS 发布器
pub struct NatsPublisher {
  url: Mutex<String>,
  connection: Mutex<Option<nats::Connection>>,
  state: Mutex<NatsState>,
  messages_published: AtomicU64,
  last_publish_time: AtomicI64,
  reconnect_attempts: AtomicU32,
  last_error: Mutex<String>,
  reconnect_interval: Duration,
  /// 0 表示不限次数
  max_reconnect_attempts: u32,
  auto_reconnect: AtomicBool,
  reconnect_running: AtomicBool,
  reconnect_stop: Arc<(Mutex<bool>, Condvar)>,
  reconnect_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NatsPublisher {
  /// 创建发布器（不立即连接）
  pub fn new(url: &str, reconnect_interval_seconds: u64, max_reconnect_attempts: u32) -> Arc<Self> {
    Arc::new(Self {
      url: Mutex::new(url.to_string()),
      connection: Mutex::new(None),
      state: Mutex::new(NatsState::Disconnected),
      messages_published: AtomicU64::new(0),
      last_publish_time: AtomicI64::new(0),
      reconnect_attempts: AtomicU32::new(0),
      last_error: Mutex::new(String::new()),
      reconnect_interval: Duration::from_secs(reconnect_interval_seconds.max(1)),
      max_reconnect_attempts,
      auto_reconnect: AtomicBool::new(true),
      reconnect_running: AtomicBool::new(false),
      reconnect_stop: Arc::new((Mutex::new(false), Condvar::new())),
      reconnect_handle: Mutex::new(None),
    })
  }

  pub fn url(&self) -> String {
    self.url.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  pub fn state(&self) -> NatsState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn stats(&self) -> NatsStats {
    NatsStats {
      messages_published: self.messages_published.load(Ordering::SeqCst),
      last_publish_time: self.last_publish_time.load(Ordering::SeqCst),
      reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
      last_error: self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone(),
    }
  }

  fn set_state(&self, new_state: NatsState) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if *state != new_state {
      debug!("NATS 状态: {} -> {}", state.as_str(), new_state.as_str());
      *state = new_state;
    }
  }

  fn set_error(&self, message: String) {
    *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = message;
  }

  /// 启动后台重连线程（已连接或已在运行时为空操作）
  pub fn start_background_reconnect(self: &Arc<Self>) {
    if self.is_connected() || self.reconnect_running.swap(true, Ordering::SeqCst) {
      return;
    }

    {
      let (stop, _) = &*self.reconnect_stop;
      *stop.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }
    self.set_state(NatsState::Reconnecting);

    let publisher = Arc::clone(self);
    let handle = thread::Builder::new()
      .name("nats-reconnect".to_string())
      .spawn(move || publisher.reconnect_loop())
      .ok();
    *self.reconnect_handle.lock().unwrap_or_else(|e| e.into_inner()) = handle;
  }

  /// 停止后台重连线程
  pub fn stop_background_reconnect(&self) {
    if !self.reconnect_running.swap(false, Ordering::SeqCst) {
      return;
    }

    let (stop, cv) = &*self.reconnect_stop;
    *stop.lock().unwrap_or_else(|e| e.into_inner()) = true;
    cv.notify_all();

    let handle = self.reconnect_handle.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(h) = handle {
      let _ = h.join();
    }
  }

  fn reconnect_loop(self: Arc<Self>) {
    info!("NATS 后台重连线程启动");

    while self.reconnect_running.load(Ordering::SeqCst) && self.auto_reconnect.load(Ordering::SeqCst) {
      let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
      if self.max_reconnect_attempts > 0 && attempts >= self.max_reconnect_attempts {
        warn!("NATS 重连达到最大尝试次数 {}", self.max_reconnect_attempts);
        break;
      }

      // 可中断的间隔等待
      {
        let (stop, cv) = &*self.reconnect_stop;
        let guard = stop.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = cv
          .wait_timeout_while(guard, self.reconnect_interval, |stopped| !*stopped)
          .unwrap_or_else(|e| e.into_inner());
        if *guard {
          break;
        }
      }

      if self.is_connected() {
        self.set_state(NatsState::Connected);
        break;
      }

      let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
      info!("NATS 重连尝试 {}", attempt);

      if self.connect().is_ok() {
        info!("NATS 重连成功");
        break;
      }
    }

    self.reconnect_running.store(false, Ordering::SeqCst);
    info!("NATS 后台重连线程退出");
  }
}

impl MessagePublisher for NatsPublisher {
  fn connect(&self) -> Result<(), PublishError> {
    {
      let connection = self.connection.lock().unwrap_or_else(|e| e.into_inner());
      if connection.is_some() && self.state() == NatsState::Connected {
        return Ok(());
      }
    }

    self.set_state(NatsState::Connecting);
    let url = self.url();
    info!("连接 NATS 服务器: {}", url);

    match nats::connect(url.as_str()) {
      Ok(conn) => {
        *self.connection.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn);
        self.set_state(NatsState::Connected);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        info!("NATS 已连接: {}", url);
        Ok(())
      }
      Err(e) => {
        self.set_state(NatsState::Disconnected);
        let message = format!("无法连接 NATS {}: {}", url, e);
        self.set_error(message.clone());
        warn!("{}", message);
        Err(PublishError::Connect(message))
      }
    }
  }

  fn disconnect(&self) {
    self.stop_background_reconnect();

    let conn = self.connection.lock().unwrap_or_else(|e| e.into_inner()).take();
    if conn.is_some() {
      self.set_state(NatsState::Disconnected);
      info!("NATS 已断开");
    }
  }

  fn is_connected(&self) -> bool {
    self.state() == NatsState::Connected
      && self.connection.lock().unwrap_or_else(|e| e.into_inner()).is_some()
  }

  fn publish(&self, event: &DetectionEvent) -> Result<(), PublishError> {
    // 断线时静默跳过，不阻塞帧循环
    if !self.is_connected() {
      return Ok(());
    }

    let subject = subject_for(&event.stream_id);
    let payload = serde_json::to_vec(event)?;
    self.publish_raw(&subject, &payload)
  }

  fn publish_raw(&self, subject: &str, payload: &[u8]) -> Result<(), PublishError> {
    let connection = self.connection.lock().unwrap_or_else(|e| e.into_inner());
    let conn = match connection.as_ref() {
      Some(c) => c,
      None => return Ok(()),
    };

    match conn.publish(subject, payload) {
      Ok(()) => {
        self.messages_published.fetch_add(1, Ordering::SeqCst);
        self.last_publish_time.store(now_timestamp_ms(), Ordering::SeqCst);
        Ok(())
      }
      Err(e) => {
        let message = format!("发布到 {} 失败: {}", subject, e);
        self.set_error(message.clone());
        Err(PublishError::Publish(message))
      }
    }
  }
}

impl Drop for NatsPublisher {
  fn drop(&mut self) {
    self.stop_background_reconnect();
  }
}

/// 每帧结果的主题：前端按流直接订阅
pub fn subject_for(stream_id: &str) -> String {
  format!("stream.{}", stream_id)
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_subject_scheme() {
    assert_eq!(subject_for("cam-1"), "stream.cam-1");
  }

  #[test]
  fn test_publish_skipped_when_disconnected() {
    let publisher = NatsPublisher::new("nats://127.0.0.1:1", 1, 1);
    let event = DetectionEvent { stream_id: "cam-1".to_string(), ..Default::default() };

    // 未连接时静默跳过
    assert!(publisher.publish(&event).is_ok());
    assert_eq!(publisher.stats().messages_published, 0);
  }

  #[test]
  fn test_state_starts_disconnected() {
    let publisher = NatsPublisher::new("nats://127.0.0.1:4222", 1, 1);
    assert_eq!(publisher.state(), NatsState::Disconnected);
    assert!(!publisher.is_connected());
  }

  #[test]
  fn test_mock_publisher_records_events() {
    let publisher = mock::MockPublisher::new_connected();
    let event = DetectionEvent { stream_id: "cam-1".to_string(), ..Default::default() };
    publisher.publish(&event).unwrap();
    assert_eq!(publisher.event_count(), 1);

    publisher.disconnect();
    publisher.publish(&event).unwrap();
    assert_eq!(publisher.event_count(), 1);
  }
}
