// 该文件是 Tianmu （天目） 项目的一部分。
// src/manager.rs - 流注册表
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 流注册表
//!
//! stream_id → 工作器的并发安全映射：唯一性与容量约束、
//! 全局回调分发、快照查询。注册表独占一个 GLib 主循环线程，
//! 驱动所有流的总线消息与重连定时器。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};

use gstreamer as gst;
use gstreamer::glib;
use thiserror::Error;
use tracing::{info, warn};

use crate::event::EventError;
use crate::npu::NpuEngine;
use crate::publisher::{MessagePublisher, NatsPublisher, NatsState, NatsStats};
use crate::stream::{StreamError, StreamProcessor, StreamWorker, WorkerOptions};
use crate::types::{
  DetectionCallback, ErrorCallback, StateChangeCallback, StreamInfo, StreamState, StreamStatus,
};

static GST_INIT: Once = Once::new();

#[derive(Error, Debug)]
pub enum ManagerError {
  #[error("流 {0} 不存在")]
  NotFound(String),
  #[error("{0}")]
  Conflict(String),
  #[error(transparent)]
  Stream(#[from] StreamError),
  #[error(transparent)]
  Event(#[from] EventError),
}

/// 工作器工厂：测试注入模拟实现
pub type ProcessorFactory =
  Box<dyn Fn(StreamInfo) -> Result<Arc<dyn StreamProcessor>, StreamError> + Send + Sync>;

#[derive(Default)]
struct GlobalCallbacks {
  detection: Option<DetectionCallback>,
  state_change: Option<StateChangeCallback>,
  error: Option<ErrorCallback>,
}

/// 流注册表
pub struct StreamManager {
  publisher: Arc<NatsPublisher>,
  engine: Arc<NpuEngine>,
  factory: ProcessorFactory,
  streams: Mutex<HashMap<String, Arc<dyn StreamProcessor>>>,
  callbacks: Mutex<GlobalCallbacks>,
  max_streams: usize,
  main_loop: glib::MainLoop,
  loop_thread: Mutex<Option<JoinHandle<()>>>,
  running: AtomicBool,
}

impl StreamManager {
  /// 以默认工作器工厂创建注册表
  pub fn create(
    publisher: Arc<NatsPublisher>,
    engine: Arc<NpuEngine>,
    max_streams: usize,
    worker_options: WorkerOptions,
  ) -> Arc<Self> {
    let factory_engine = Arc::clone(&engine);
    let factory_publisher = Arc::clone(&publisher) as Arc<dyn MessagePublisher>;
    let factory: ProcessorFactory = Box::new(move |info| {
      let worker = StreamWorker::create(
        info,
        Arc::clone(&factory_engine),
        Arc::clone(&factory_publisher),
        worker_options.clone(),
      )?;
      Ok(Arc::new(worker) as Arc<dyn StreamProcessor>)
    });

    Self::with_factory(publisher, engine, max_streams, factory)
  }

  /// 用自定义工厂创建（测试注入模拟工作器）
  pub fn with_factory(
    publisher: Arc<NatsPublisher>,
    engine: Arc<NpuEngine>,
    max_streams: usize,
    factory: ProcessorFactory,
  ) -> Arc<Self> {
    Arc::new(Self {
      publisher,
      engine,
      factory,
      streams: Mutex::new(HashMap::new()),
      callbacks: Mutex::new(GlobalCallbacks::default()),
      max_streams,
      main_loop: glib::MainLoop::new(None, false),
      loop_thread: Mutex::new(None),
      running: AtomicBool::new(false),
    })
  }

  pub fn engine(&self) -> &Arc<NpuEngine> {
    &self.engine
  }

  /// 启动：连接总线（失败转后台重连）并拉起 GLib 主循环线程
  pub fn start(&self) {
    if self.running.swap(true, Ordering::SeqCst) {
      return;
    }

    info!("流注册表启动中...");

    GST_INIT.call_once(|| {
      if let Err(e) = gst::init() {
        warn!("GStreamer 初始化失败: {}", e);
      } else {
        info!("GStreamer 已初始化");
      }
    });

    if let Err(e) = self.publisher.connect() {
      warn!("NATS 连接失败: {}，后台将持续重连，结果信封在连通前跳过", e);
    }
    self.publisher.start_background_reconnect();

    let main_loop = self.main_loop.clone();
    let handle = thread::Builder::new()
      .name("gst-main-loop".to_string())
      .spawn(move || {
        info!("GLib 主循环线程启动");
        main_loop.run();
        info!("GLib 主循环线程退出");
      })
      .ok();
    *self.loop_thread.lock().unwrap_or_else(|e| e.into_inner()) = handle;

    info!("流注册表已启动");
  }

  /// 停止：先停所有流，再退出主循环并断开总线
  pub fn stop(&self) {
    if !self.running.swap(false, Ordering::SeqCst) {
      return;
    }

    info!("流注册表停止中...");

    {
      let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
      for (_, processor) in streams.iter() {
        processor.stop();
      }
      streams.clear();
    }

    if self.main_loop.is_running() {
      self.main_loop.quit();
    }
    let handle = self.loop_thread.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(h) = handle {
      let _ = h.join();
    }

    self.publisher.disconnect();
    info!("流注册表已停止");
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  // ---- 流管理 ----

  /// 添加并启动一条流；返回启动后的状态
  pub fn add_stream(&self, info: StreamInfo) -> Result<StreamState, ManagerError> {
    let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());

    if streams.contains_key(&info.stream_id) {
      return Err(ManagerError::Conflict(format!("流 {} 已存在", info.stream_id)));
    }
    if streams.len() >= self.max_streams {
      return Err(ManagerError::Conflict(format!("已达到最大流数量 {}", self.max_streams)));
    }

    let stream_id = info.stream_id.clone();
    let processor = (self.factory)(info)?;
    self.apply_callbacks(processor.as_ref());

    processor.start()?;
    let state = processor.state();
    streams.insert(stream_id.clone(), processor);

    info!("流已添加: {}", stream_id);
    Ok(state)
  }

  pub fn remove_stream(&self, stream_id: &str) -> Result<(), ManagerError> {
    let removed = {
      let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
      streams.remove(stream_id)
    };

    match removed {
      Some(processor) => {
        processor.stop();
        info!("流已移除: {}", stream_id);
        Ok(())
      }
      None => Err(ManagerError::NotFound(stream_id.to_string())),
    }
  }

  pub fn update_stream(&self, info: StreamInfo) -> Result<(), ManagerError> {
    let processor = self.get_processor(&info.stream_id)?;
    processor.update(info)?;
    Ok(())
  }

  pub fn clear_stream_inference(&self, stream_id: &str) -> Result<(), ManagerError> {
    let processor = self.get_processor(stream_id)?;
    processor.clear_inference()?;
    info!("流 {} 已卸下推理", stream_id);
    Ok(())
  }

  pub fn update_event_settings(
    &self,
    stream_id: &str,
    settings_json: &str,
  ) -> Result<Vec<String>, ManagerError> {
    let processor = self.get_processor(stream_id)?;
    let terminals = processor.update_event_settings(settings_json)?;
    info!("流 {} 事件规则已更新", stream_id);
    Ok(terminals)
  }

  pub fn clear_event_settings(&self, stream_id: &str) -> Result<(), ManagerError> {
    let processor = self.get_processor(stream_id)?;
    processor.clear_event_settings();
    Ok(())
  }

  // ---- 查询 ----

  pub fn stream_status(&self, stream_id: &str) -> Option<StreamStatus> {
    let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
    streams.get(stream_id).map(|p| p.status())
  }

  pub fn all_stream_status(&self) -> Vec<StreamStatus> {
    let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
    let mut list: Vec<StreamStatus> = streams.values().map(|p| p.status()).collect();
    list.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
    list
  }

  pub fn stream_count(&self) -> usize {
    self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn has_stream(&self, stream_id: &str) -> bool {
    self.streams.lock().unwrap_or_else(|e| e.into_inner()).contains_key(stream_id)
  }

  /// 最近一帧 JPEG 快照；流不存在或未出帧时为 None
  pub fn snapshot(&self, stream_id: &str) -> Option<Vec<u8>> {
    let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
    streams.get(stream_id).and_then(|p| p.snapshot())
  }

  /// 使用指定模型的流 ID 列表
  pub fn streams_using_model(&self, model_id: &str) -> Vec<String> {
    let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
    let mut ids: Vec<String> = streams
      .values()
      .filter(|p| p.model_id() == model_id)
      .map(|p| p.stream_id())
      .collect();
    ids.sort();
    ids
  }

  // ---- NATS 状态 ----

  pub fn is_nats_connected(&self) -> bool {
    self.publisher.is_connected()
  }

  pub fn nats_state(&self) -> NatsState {
    self.publisher.state()
  }

  pub fn nats_stats(&self) -> NatsStats {
    self.publisher.stats()
  }

  // ---- 全局回调 ----

  pub fn set_global_detection_callback(&self, callback: DetectionCallback) {
    self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).detection = Some(callback.clone());
    let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
    for processor in streams.values() {
      processor.set_detection_callback(callback.clone());
    }
  }

  pub fn set_global_state_change_callback(&self, callback: StateChangeCallback) {
    self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).state_change = Some(callback.clone());
    let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
    for processor in streams.values() {
      processor.set_state_change_callback(callback.clone());
    }
  }

  pub fn set_global_error_callback(&self, callback: ErrorCallback) {
    self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).error = Some(callback.clone());
    let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
    for processor in streams.values() {
      processor.set_error_callback(callback.clone());
    }
  }

  /// 新建工作器时复制全局回调
  fn apply_callbacks(&self, processor: &dyn StreamProcessor) {
    let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(cb) = callbacks.detection.clone() {
      processor.set_detection_callback(cb);
    }
    if let Some(cb) = callbacks.state_change.clone() {
      processor.set_state_change_callback(cb);
    }
    if let Some(cb) = callbacks.error.clone() {
      processor.set_error_callback(cb);
    }
  }

  fn get_processor(&self, stream_id: &str) -> Result<Arc<dyn StreamProcessor>, ManagerError> {
    let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
    streams
      .get(stream_id)
      .cloned()
      .ok_or_else(|| ManagerError::NotFound(stream_id.to_string()))
  }
}

impl Drop for StreamManager {
  fn drop(&mut self) {
    self.stop();
  }
}
