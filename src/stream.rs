// 该文件是 Tianmu （天目） 项目的一部分。
// src/stream.rs - 流工作器
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 流工作器
//!
//! 每条 RTSP 流一个工作器：驱动 GStreamer 管道拉取解码后的
//! RGB 帧，送推理（直连或经批量调度器）、跑事件规则、组装
//! 结果信封发布到总线。
//!
//! 状态机：`Idle → Starting → Running → (Error|Reconnecting)`，
//! 管道错误按线性退避重连（3 秒 × 尝试次数），连续 10 次失败
//! 进入 Error 终态；管道成功进入 Playing 时清零计数。

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::batch::BatchScheduler;
use crate::event::{EventCompositor, EventError};
use crate::npu::{NpuEngine, NpuError, NpuModel};
use crate::publisher::MessagePublisher;
use crate::types::{
  now_timestamp_ms, DetectionCallback, DetectionEvent, ErrorCallback, StateChangeCallback,
  StreamInfo, StreamState, StreamStatus, MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_SECONDS,
};

/// 批量推理结果的设备侧超时余量
const BATCH_RESULT_MARGIN: Duration = Duration::from_secs(31);

#[derive(Error, Debug)]
pub enum StreamError {
  #[error("流描述无效: {0}")]
  InvalidDescriptor(String),
  #[error("模型加载失败: {0}")]
  Model(#[from] NpuError),
  #[error("管道错误: {0}")]
  Pipeline(String),
  #[error("GStreamer 错误: {0}")]
  Glib(#[from] glib::Error),
  #[error("GStreamer 布尔错误: {0}")]
  GlibBool(#[from] glib::BoolError),
  #[error("管道状态切换失败: {0}")]
  StateChange(#[from] gst::StateChangeError),
}

/// 流处理抽象；注册表通过该接口管理工作器，测试可注入模拟实现
pub trait StreamProcessor: Send + Sync {
  fn stream_id(&self) -> String;
  fn start(&self) -> Result<(), StreamError>;
  fn stop(&self);
  fn update(&self, new_info: StreamInfo) -> Result<(), StreamError>;
  fn clear_inference(&self) -> Result<(), StreamError>;
  fn state(&self) -> StreamState;
  fn status(&self) -> StreamStatus;
  fn model_id(&self) -> String;
  fn snapshot(&self) -> Option<Vec<u8>>;
  fn update_event_settings(&self, settings_json: &str) -> Result<Vec<String>, EventError>;
  fn clear_event_settings(&self);
  fn event_setting_count(&self) -> usize;
  fn set_detection_callback(&self, callback: DetectionCallback);
  fn set_state_change_callback(&self, callback: StateChangeCallback);
  fn set_error_callback(&self, callback: ErrorCallback);
}

/// 流工作器运行参数（来自守护进程配置）
#[derive(Debug, Clone)]
pub struct WorkerOptions {
  pub rtsp_latency_ms: u32,
  pub rtsp_timeout_us: u64,
  pub rtsp_retry: u32,
  pub jpeg_quality: u8,
  pub publish_images: bool,
  pub batch_timeout_ms: u64,
}

impl Default for WorkerOptions {
  fn default() -> Self {
    Self {
      rtsp_latency_ms: 0,
      rtsp_timeout_us: 10_000_000,
      rtsp_retry: 3,
      jpeg_quality: 80,
      publish_images: false,
      batch_timeout_ms: crate::batch::DEFAULT_BATCH_TIMEOUT_MS,
    }
  }
}

#[derive(Default)]
struct WorkerCallbacks {
  detection: Option<DetectionCallback>,
  state_change: Option<StateChangeCallback>,
  error: Option<ErrorCallback>,
}

struct FpsWindow {
  frames_since_update: u64,
  last_update: Instant,
  current: f64,
}

struct PipelineHandles {
  pipeline: gst::Pipeline,
  _bus_watch: gst::bus::BusWatchGuard,
}

#[derive(Default)]
struct ReconnectState {
  attempts: u32,
  source: Option<glib::SourceId>,
}

struct WorkerInner {
  stream_id: String,
  engine: Arc<NpuEngine>,
  publisher: Arc<dyn MessagePublisher>,
  compositor: EventCompositor,
  options: WorkerOptions,

  info: Mutex<StreamInfo>,
  state: Mutex<StreamState>,
  model: Mutex<Option<Arc<NpuModel>>>,
  scheduler: Mutex<Option<Arc<BatchScheduler>>>,
  pipeline: Mutex<Option<PipelineHandles>>,
  reconnect: Mutex<ReconnectState>,

  snapshot: Mutex<Option<Vec<u8>>>,
  last_error: Mutex<String>,
  callbacks: Mutex<WorkerCallbacks>,

  frame_count: AtomicU64,
  fps: Mutex<FpsWindow>,
  start_time: Mutex<Option<Instant>>,
  last_detection_time: AtomicI64,
  frame_size: Mutex<(i32, i32)>,
  publish_images: AtomicBool,
}

/// 单条流的工作器
pub struct StreamWorker {
  inner: Arc<WorkerInner>,
}

impl StreamWorker {
  /// 校验描述符并创建工作器（不启动管道）
  pub fn create(
    info: StreamInfo,
    engine: Arc<NpuEngine>,
    publisher: Arc<dyn MessagePublisher>,
    options: WorkerOptions,
  ) -> Result<Self, StreamError> {
    if info.stream_id.is_empty() {
      return Err(StreamError::InvalidDescriptor("stream_id 不能为空".to_string()));
    }
    if info.source_url.is_empty() {
      return Err(StreamError::InvalidDescriptor("source_url 不能为空".to_string()));
    }

    let url = Url::parse(&info.source_url)
      .map_err(|e| StreamError::InvalidDescriptor(format!("source_url 无效: {}", e)))?;
    if !url.scheme().starts_with("rtsp") {
      return Err(StreamError::InvalidDescriptor(format!(
        "source_url 必须是 rtsp 流, 实际 scheme 为 {}",
        url.scheme()
      )));
    }
    // model_path 可为空：纯视频流（无推理）

    let publish_images = options.publish_images;
    let inner = Arc::new(WorkerInner {
      stream_id: info.stream_id.clone(),
      engine,
      publisher,
      compositor: EventCompositor::new(),
      options,
      info: Mutex::new(info),
      state: Mutex::new(StreamState::Stopped),
      model: Mutex::new(None),
      scheduler: Mutex::new(None),
      pipeline: Mutex::new(None),
      reconnect: Mutex::new(ReconnectState::default()),
      snapshot: Mutex::new(None),
      last_error: Mutex::new(String::new()),
      callbacks: Mutex::new(WorkerCallbacks::default()),
      frame_count: AtomicU64::new(0),
      fps: Mutex::new(FpsWindow { frames_since_update: 0, last_update: Instant::now(), current: 0.0 }),
      start_time: Mutex::new(None),
      last_detection_time: AtomicI64::new(0),
      frame_size: Mutex::new((0, 0)),
      publish_images: AtomicBool::new(publish_images),
    });

    Ok(Self { inner })
  }

  /// 开启/关闭信封随帧附带 JPEG 快照
  pub fn set_publish_images(&self, enabled: bool) {
    self.inner.publish_images.store(enabled, Ordering::SeqCst);
  }

  #[cfg(test)]
  pub(crate) fn feed_frame(&self, rgb: &[u8], width: i32, height: i32) {
    self.inner.process_frame(rgb, width, height);
  }

  #[cfg(test)]
  pub(crate) fn simulate_pipeline_failure(&self) {
    self.inner.set_error("模拟管道失败");
    self.inner.schedule_reconnect_locked_test();
  }

  #[cfg(test)]
  pub(crate) fn reconnect_attempts(&self) -> u32 {
    self.inner.reconnect.lock().unwrap().attempts
  }
}

impl StreamProcessor for StreamWorker {
  fn stream_id(&self) -> String {
    self.inner.stream_id.clone()
  }

  fn start(&self) -> Result<(), StreamError> {
    self.inner.start()
  }

  fn stop(&self) {
    self.inner.stop();
  }

  fn update(&self, new_info: StreamInfo) -> Result<(), StreamError> {
    self.inner.update(new_info)
  }

  fn clear_inference(&self) -> Result<(), StreamError> {
    self.inner.clear_inference()
  }

  fn state(&self) -> StreamState {
    self.inner.state()
  }

  fn status(&self) -> StreamStatus {
    self.inner.status()
  }

  fn model_id(&self) -> String {
    self.inner.info.lock().unwrap_or_else(|e| e.into_inner()).model_id.clone()
  }

  fn snapshot(&self) -> Option<Vec<u8>> {
    self.inner.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  fn update_event_settings(&self, settings_json: &str) -> Result<Vec<String>, EventError> {
    self.inner.compositor.update_settings(settings_json)
  }

  fn clear_event_settings(&self) {
    self.inner.compositor.clear_settings();
  }

  fn event_setting_count(&self) -> usize {
    self.inner.compositor.setting_count()
  }

  fn set_detection_callback(&self, callback: DetectionCallback) {
    self.inner.callbacks.lock().unwrap_or_else(|e| e.into_inner()).detection = Some(callback);
  }

  fn set_state_change_callback(&self, callback: StateChangeCallback) {
    self.inner.callbacks.lock().unwrap_or_else(|e| e.into_inner()).state_change = Some(callback);
  }

  fn set_error_callback(&self, callback: ErrorCallback) {
    self.inner.callbacks.lock().unwrap_or_else(|e| e.into_inner()).error = Some(callback);
  }
}

impl Drop for StreamWorker {
  fn drop(&mut self) {
    self.inner.stop();
  }
}

/// 线性退避：第 n 次重连前等待 3n 秒
fn reconnect_delay_seconds(attempts: u32) -> u32 {
  RECONNECT_DELAY_SECONDS * attempts
}

impl WorkerInner {
  fn state(&self) -> StreamState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, new_state: StreamState) {
    let old_state = {
      let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
      std::mem::replace(&mut *state, new_state)
    };

    if old_state != new_state {
      info!("流 {} 状态: {} -> {}", self.stream_id, old_state, new_state);
      let callback = self
        .callbacks
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .state_change
        .clone();
      if let Some(cb) = callback {
        cb(&self.stream_id, new_state);
      }
    }
  }

  fn set_error(&self, message: &str) {
    *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = message.to_string();
    error!("流 {} 错误: {}", self.stream_id, message);

    let callback = self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).error.clone();
    if let Some(cb) = callback {
      cb(&self.stream_id, message);
    }
  }

  fn start(self: &Arc<Self>) -> Result<(), StreamError> {
    {
      let state = self.state();
      if state == StreamState::Running || state == StreamState::Starting {
        return Ok(());
      }
    }

    self.set_state(StreamState::Starting);
    info!("启动流: {}", self.stream_id);

    if let Err(e) = self.create_pipeline() {
      self.set_error(&e.to_string());
      self.set_state(StreamState::Error);
      return Err(e);
    }

    {
      let guard = self.pipeline.lock().unwrap_or_else(|e| e.into_inner());
      if let Some(handles) = guard.as_ref() {
        if let Err(e) = handles.pipeline.set_state(gst::State::Playing) {
          drop(guard);
          self.teardown_pipeline();
          self.set_error("管道启动失败");
          self.set_state(StreamState::Error);
          return Err(StreamError::StateChange(e));
        }
      }
    }

    self.frame_count.store(0, Ordering::SeqCst);
    {
      let mut fps = self.fps.lock().unwrap_or_else(|e| e.into_inner());
      fps.frames_since_update = 0;
      fps.last_update = Instant::now();
      fps.current = 0.0;
    }
    *self.start_time.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

    self.set_state(StreamState::Running);
    info!("流已启动: {}", self.stream_id);
    Ok(())
  }

  fn stop(&self) {
    if self.state() == StreamState::Stopped {
      return;
    }

    info!("停止流: {}", self.stream_id);
    self.cancel_reconnect();
    self.teardown_pipeline();
    *self.start_time.lock().unwrap_or_else(|e| e.into_inner()) = None;
    self.set_state(StreamState::Stopped);
    info!("流已停止: {}", self.stream_id);
  }

  /// 更新配置并重启；新描述中省略的模型字段沿用旧值
  fn update(self: &Arc<Self>, new_info: StreamInfo) -> Result<(), StreamError> {
    info!("更新流: {}", self.stream_id);
    self.stop();

    {
      let mut info = self.info.lock().unwrap_or_else(|e| e.into_inner());
      info.source_url = new_info.source_url;
      if !new_info.model_path.is_empty() {
        info.model_path = new_info.model_path;
      }
      if !new_info.model_id.is_empty() {
        info.model_id = new_info.model_id;
      }
      info.config = new_info.config;
      if !new_info.task.is_empty() {
        info.task = new_info.task;
      }
      info.num_keypoints = new_info.num_keypoints;
      if !new_info.labels.is_empty() {
        info.labels = new_info.labels;
      }
    }

    self.start()
  }

  /// 卸下模型，以纯视频模式重启
  fn clear_inference(self: &Arc<Self>) -> Result<(), StreamError> {
    info!("流 {} 卸下推理模型", self.stream_id);
    self.stop();

    {
      let mut info = self.info.lock().unwrap_or_else(|e| e.into_inner());
      info.model_path.clear();
      info.model_id.clear();
    }
    *self.model.lock().unwrap_or_else(|e| e.into_inner()) = None;
    *self.scheduler.lock().unwrap_or_else(|e| e.into_inner()) = None;

    self.start()
  }

  fn status(&self) -> StreamStatus {
    let info = self.info.lock().unwrap_or_else(|e| e.into_inner());
    let state = self.state();

    let uptime_seconds = if state == StreamState::Running || state == StreamState::Reconnecting {
      self
        .start_time
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .map(|t| t.elapsed().as_secs())
        .unwrap_or(0)
    } else {
      0
    };

    StreamStatus {
      stream_id: self.stream_id.clone(),
      source_url: info.source_url.clone(),
      model_id: info.model_id.clone(),
      state: state.as_str().to_string(),
      frame_count: self.frame_count.load(Ordering::SeqCst),
      current_fps: self.fps.lock().unwrap_or_else(|e| e.into_inner()).current,
      uptime_seconds,
      last_error: self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone(),
      last_detection_time: self.last_detection_time.load(Ordering::SeqCst),
    }
  }

  // ---- 管道管理 ----

  fn create_pipeline(self: &Arc<Self>) -> Result<(), StreamError> {
    let info = self.info.lock().unwrap_or_else(|e| e.into_inner()).clone();

    // 先装配模型（共享句柄）
    if !info.model_path.is_empty() {
      let model = self.engine.get_or_load(&info.model_path)?;
      model.configure(&info.task, info.num_keypoints as usize, info.labels.clone());

      if model.batch_size() > 1 {
        let scheduler = model.batch_scheduler(
          self.options.batch_timeout_ms,
          info.config.confidence_threshold,
        );
        *self.scheduler.lock().unwrap_or_else(|e| e.into_inner()) = scheduler;
      }
      *self.model.lock().unwrap_or_else(|e| e.into_inner()) = Some(model);
      info!("流 {} 已挂载模型 {}", self.stream_id, info.model_path);
    } else {
      info!("流 {} 以纯视频模式运行（无推理）", self.stream_id);
    }

    let pipeline_desc = self.build_pipeline_description(&info.source_url);
    info!("创建管道: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| StreamError::Pipeline("解析结果不是 Pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or_else(|| StreamError::Pipeline("找不到 appsink 元素".to_string()))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| StreamError::Pipeline("appsink 类型转换失败".to_string()))?;

    let weak = Arc::downgrade(self);
    appsink.set_callbacks(
      gst_app::AppSinkCallbacks::builder()
        .new_sample(move |sink| match weak.upgrade() {
          Some(worker) => worker.on_sample(sink),
          None => Err(gst::FlowError::Eos),
        })
        .build(),
    );

    let bus = pipeline
      .bus()
      .ok_or_else(|| StreamError::Pipeline("管道没有消息总线".to_string()))?;
    let weak = Arc::downgrade(self);
    let bus_watch = bus.add_watch(move |_, msg| {
      if let Some(worker) = weak.upgrade() {
        worker.on_bus_message(msg);
      }
      glib::ControlFlow::Continue
    })?;

    *self.pipeline.lock().unwrap_or_else(|e| e.into_inner()) =
      Some(PipelineHandles { pipeline, _bus_watch: bus_watch });
    Ok(())
  }

  fn teardown_pipeline(&self) {
    let handles = self.pipeline.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(handles) = handles {
      if let Err(e) = handles.pipeline.set_state(gst::State::Null) {
        warn!("流 {} 管道停止失败: {}", self.stream_id, e);
      }
    }
  }

  /// RTSP 源固定 TCP 传输；分辨率自动探测，模型输入由推理层 letterbox
  fn build_pipeline_description(&self, source_url: &str) -> String {
    format!(
      "rtspsrc location=\"{}\" latency={} timeout={} retry={} protocols=tcp name=src \
       ! rtph264depay ! h264parse ! avdec_h264 ! videoconvert ! video/x-raw,format=RGB \
       ! appsink name=sink max-buffers=1 drop=true sync=false",
      source_url, self.options.rtsp_latency_ms, self.options.rtsp_timeout_us, self.options.rtsp_retry
    )
  }

  // ---- 重连 ----

  fn schedule_reconnect(self: &Arc<Self>) {
    if self.state() == StreamState::Stopped {
      return;
    }

    let delay = {
      let mut reconnect = self.reconnect.lock().unwrap_or_else(|e| e.into_inner());
      if reconnect.source.is_some() {
        // 已有待触发的重连
        return;
      }

      if reconnect.attempts >= MAX_RECONNECT_ATTEMPTS {
        drop(reconnect);
        self.set_error("重连次数达到上限");
        self.set_state(StreamState::Error);
        return;
      }

      reconnect.attempts += 1;
      reconnect_delay_seconds(reconnect.attempts)
    };

    self.set_state(StreamState::Reconnecting);
    let attempts = self.reconnect.lock().unwrap_or_else(|e| e.into_inner()).attempts;
    warn!(
      "流 {} 将在 {} 秒后重连 (第 {}/{} 次)",
      self.stream_id, delay, attempts, MAX_RECONNECT_ATTEMPTS
    );

    let weak = Arc::downgrade(self);
    let source = glib::timeout_add_seconds(delay, move || {
      if let Some(worker) = weak.upgrade() {
        worker.on_reconnect_timeout();
      }
      glib::ControlFlow::Break
    });

    self.reconnect.lock().unwrap_or_else(|e| e.into_inner()).source = Some(source);
  }

  fn cancel_reconnect(&self) {
    let source = self.reconnect.lock().unwrap_or_else(|e| e.into_inner()).source.take();
    if let Some(source) = source {
      source.remove();
    }
  }

  fn on_reconnect_timeout(self: &Arc<Self>) {
    self.reconnect.lock().unwrap_or_else(|e| e.into_inner()).source = None;

    if self.state() == StreamState::Stopped {
      return;
    }

    info!("流 {} 尝试重连", self.stream_id);
    self.teardown_pipeline();

    if let Err(e) = self.start() {
      error!("流 {} 重连失败: {}", self.stream_id, e);
      self.schedule_reconnect();
    }
  }

  #[cfg(test)]
  fn schedule_reconnect_locked_test(self: &Arc<Self>) {
    // 测试中不挂真实定时器：推进计数并复现状态迁移
    if self.state() == StreamState::Stopped {
      return;
    }
    let mut reconnect = self.reconnect.lock().unwrap();
    if reconnect.attempts >= MAX_RECONNECT_ATTEMPTS {
      drop(reconnect);
      self.set_error("重连次数达到上限");
      self.set_state(StreamState::Error);
      return;
    }
    reconnect.attempts += 1;
    drop(reconnect);
    self.set_state(StreamState::Reconnecting);
  }

  // ---- 帧处理 ----

  fn on_sample(self: &Arc<Self>, sink: &gst_app::AppSink) -> Result<gst::FlowSuccess, gst::FlowError> {
    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;

    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
    let caps = sample.caps().ok_or(gst::FlowError::Error)?;

    // 分辨率从 caps 自动探测，首帧拿不到时退回配置值
    let (mut width, mut height) = match gst_video::VideoInfo::from_caps(caps) {
      Ok(video_info) => (video_info.width() as i32, video_info.height() as i32),
      Err(_) => (0, 0),
    };
    if width <= 0 || height <= 0 {
      let info = self.info.lock().unwrap_or_else(|e| e.into_inner());
      width = info.config.width;
      height = info.config.height;
    }

    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
    let data = map.as_slice();

    let expected = (width * height * 3) as usize;
    if data.len() < expected {
      warn!(
        "流 {} 缓冲区大小不匹配: 预期 {} 实际 {}",
        self.stream_id,
        expected,
        data.len()
      );
      return Ok(gst::FlowSuccess::Ok);
    }

    self.process_frame(&data[..expected], width, height);
    Ok(gst::FlowSuccess::Ok)
  }

  fn process_frame(self: &Arc<Self>, rgb: &[u8], width: i32, height: i32) {
    let frame_number = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
    self.update_fps();

    {
      let mut size = self.frame_size.lock().unwrap_or_else(|e| e.into_inner());
      if *size != (width, height) {
        info!("流 {} 分辨率: {}x{}", self.stream_id, width, height);
        *size = (width, height);
      }
    }

    let confidence_threshold = {
      let info = self.info.lock().unwrap_or_else(|e| e.into_inner());
      info.config.confidence_threshold
    };

    // 推理：batch_size == 1 直连；否则经批量调度器（复制提交）
    let mut detections = Vec::new();
    let model = self.model.lock().unwrap_or_else(|e| e.into_inner()).clone();
    if let Some(model) = model {
      let scheduler = self.scheduler.lock().unwrap_or_else(|e| e.into_inner()).clone();
      match scheduler {
        Some(scheduler) => {
          let (tx, rx) = mpsc::channel();
          scheduler.submit(
            &self.stream_id,
            rgb,
            width,
            height,
            Box::new(move |result| {
              let _ = tx.send(result);
            }),
          );
          let wait = Duration::from_millis(self.options.batch_timeout_ms) + BATCH_RESULT_MARGIN;
          detections = rx.recv_timeout(wait).unwrap_or_default();
          // 批量调度器按全局阈值跑，这里再按本流阈值过滤
          detections.retain(|d| d.confidence >= confidence_threshold);
        }
        None => {
          detections = model.run_single(rgb, width, height, confidence_threshold);
        }
      }
    }

    // 快照槽只保留最新一帧
    let jpeg = encode_jpeg(rgb, width as u32, height as u32, self.options.jpeg_quality);
    if let Some(ref jpeg) = jpeg {
      *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(jpeg.clone());
    }

    let events = self.compositor.check_frame(&mut detections, width, height);

    let timestamp = now_timestamp_ms();
    if !detections.is_empty() {
      self.last_detection_time.store(timestamp, Ordering::SeqCst);
    }

    let event = DetectionEvent {
      stream_id: self.stream_id.clone(),
      timestamp,
      frame_number,
      fps: self.fps.lock().unwrap_or_else(|e| e.into_inner()).current,
      width,
      height,
      detections,
      events,
      image: if self.publish_images.load(Ordering::SeqCst) { jpeg } else { None },
    };

    // 发布 fire-and-forget：断线静默跳过，不阻塞帧循环
    if self.publisher.is_connected() {
      if let Err(e) = self.publisher.publish(&event) {
        warn!("流 {} 发布失败: {}", self.stream_id, e);
      }
    }

    let callback = self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).detection.clone();
    if let Some(cb) = callback {
      cb(&event);
    }
  }

  /// 1 秒滑动窗口更新 FPS
  fn update_fps(&self) {
    let mut fps = self.fps.lock().unwrap_or_else(|e| e.into_inner());
    fps.frames_since_update += 1;

    let elapsed = fps.last_update.elapsed();
    if elapsed >= Duration::from_secs(1) {
      fps.current = fps.frames_since_update as f64 / elapsed.as_secs_f64();
      fps.frames_since_update = 0;
      fps.last_update = Instant::now();
    }
  }

  // ---- 总线消息 ----

  fn on_bus_message(self: &Arc<Self>, msg: &gst::Message) {
    match msg.view() {
      gst::MessageView::Error(err) => {
        self.set_error(&format!("管道错误: {}", err.error()));
        self.schedule_reconnect();
      }
      gst::MessageView::Eos(_) => {
        warn!("流 {} 收到 EOS", self.stream_id);
        self.schedule_reconnect();
      }
      gst::MessageView::StateChanged(state_changed) => {
        let from_pipeline = msg
          .src()
          .map(|s| s.is::<gst::Pipeline>())
          .unwrap_or(false);
        if from_pipeline && state_changed.current() == gst::State::Playing {
          if self.state() != StreamState::Running {
            self.set_state(StreamState::Running);
          }
          // 成功进入 Playing 即清零重连计数
          self.reconnect.lock().unwrap_or_else(|e| e.into_inner()).attempts = 0;
        }
      }
      gst::MessageView::Warning(w) => {
        debug!("流 {} 管道警告: {}", self.stream_id, w.error());
      }
      _ => {}
    }
  }
}

fn encode_jpeg(rgb: &[u8], width: u32, height: u32, quality: u8) -> Option<Vec<u8>> {
  let mut out = Vec::new();
  let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
  match encoder.encode(rgb, width, height, image::ColorType::Rgb8) {
    Ok(()) => Some(out),
    Err(e) => {
      warn!("JPEG 编码失败: {}", e);
      None
    }
  }
}

/// 测试用模拟流处理器
#[cfg(test)]
pub mod mock {
  use std::sync::atomic::{AtomicU64, Ordering};
  use std::sync::Mutex;

  use super::*;

  /// 不依赖 GStreamer 的模拟流处理器
  pub struct MockStreamProcessor {
    pub info: Mutex<StreamInfo>,
    pub state: Mutex<StreamState>,
    pub frame_count: AtomicU64,
    pub fail_start: Mutex<Option<String>>,
    pub snapshot_data: Mutex<Option<Vec<u8>>>,
    pub compositor: EventCompositor,
    pub callbacks: Mutex<WorkerCallbacks>,
  }

  impl MockStreamProcessor {
    pub fn new(info: StreamInfo) -> Self {
      Self {
        info: Mutex::new(info),
        state: Mutex::new(StreamState::Stopped),
        frame_count: AtomicU64::new(0),
        fail_start: Mutex::new(None),
        snapshot_data: Mutex::new(None),
        compositor: EventCompositor::new(),
        callbacks: Mutex::new(WorkerCallbacks::default()),
      }
    }

    pub fn set_fail_start(&self, message: &str) {
      *self.fail_start.lock().unwrap() = Some(message.to_string());
    }

    pub fn simulate_detection(&self, event: &DetectionEvent) {
      self.frame_count.fetch_add(1, Ordering::SeqCst);
      let callback = self.callbacks.lock().unwrap().detection.clone();
      if let Some(cb) = callback {
        cb(event);
      }
    }
  }

  impl StreamProcessor for MockStreamProcessor {
    fn stream_id(&self) -> String {
      self.info.lock().unwrap().stream_id.clone()
    }

    fn start(&self) -> Result<(), StreamError> {
      if let Some(message) = self.fail_start.lock().unwrap().clone() {
        return Err(StreamError::Pipeline(message));
      }
      *self.state.lock().unwrap() = StreamState::Running;
      Ok(())
    }

    fn stop(&self) {
      *self.state.lock().unwrap() = StreamState::Stopped;
    }

    fn update(&self, new_info: StreamInfo) -> Result<(), StreamError> {
      *self.info.lock().unwrap() = new_info;
      self.start()
    }

    fn clear_inference(&self) -> Result<(), StreamError> {
      let mut info = self.info.lock().unwrap();
      info.model_path.clear();
      info.model_id.clear();
      drop(info);
      self.start()
    }

    fn state(&self) -> StreamState {
      *self.state.lock().unwrap()
    }

    fn status(&self) -> StreamStatus {
      let info = self.info.lock().unwrap();
      StreamStatus {
        stream_id: info.stream_id.clone(),
        source_url: info.source_url.clone(),
        model_id: info.model_id.clone(),
        state: self.state().as_str().to_string(),
        frame_count: self.frame_count.load(Ordering::SeqCst),
        ..Default::default()
      }
    }

    fn model_id(&self) -> String {
      self.info.lock().unwrap().model_id.clone()
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
      self.snapshot_data.lock().unwrap().clone()
    }

    fn update_event_settings(&self, settings_json: &str) -> Result<Vec<String>, EventError> {
      self.compositor.update_settings(settings_json)
    }

    fn clear_event_settings(&self) {
      self.compositor.clear_settings();
    }

    fn event_setting_count(&self) -> usize {
      self.compositor.setting_count()
    }

    fn set_detection_callback(&self, callback: DetectionCallback) {
      self.callbacks.lock().unwrap().detection = Some(callback);
    }

    fn set_state_change_callback(&self, callback: StateChangeCallback) {
      self.callbacks.lock().unwrap().state_change = Some(callback);
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
      self.callbacks.lock().unwrap().error = Some(callback);
    }
  }
}
