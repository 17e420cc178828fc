// 该文件是 Tianmu （天目） 项目的一部分。
// src/npu.rs - 共享 NPU 推理引擎
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 共享 NPU 推理引擎
//!
//! 设备句柄进程级共享：同一模型文件只配置一次网络，
//! 被引用它的所有流共用。每个模型有独立互斥锁串行化
//! 设备调用并保护预分配的输入/输出缓冲区。
//!
//! 设备瞬时错误（写入/读取超时）只影响当前帧：记录告警、
//! 退避 100 毫秒、返回空检测，模型句柄保持可用。
//! 输出缓冲区大小不匹配则是该模型的致命错误：句柄标记为
//! 不可用，引擎在下次加载时将其从缓存剔除。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::batch::BatchScheduler;
use crate::geometry::{letterbox_resize, LetterboxInfo, LETTERBOX_PAD_VALUE};
use crate::types::Detection;

pub mod device;
mod postprocess;

pub use device::{NmsShape, NpuNetwork, OutputInfo};

/// 设备瞬时错误后的退避时长
const DEVICE_ERROR_BACKOFF: Duration = Duration::from_millis(100);
/// 原始输出 NMS 的 IoU 阈值
const RAW_YOLO_IOU_THRESHOLD: f32 = 0.45;
/// NMS 元数据缺失时的默认类别数
const DEFAULT_NUM_CLASSES: usize = 80;
/// NMS 元数据缺失时每类默认最大框数
const DEFAULT_MAX_BBOXES: usize = 100;

#[derive(Error, Debug)]
pub enum NpuError {
  #[error("模型加载失败: {0}")]
  ModelLoad(String),
  #[error("设备错误: {0}")]
  Device(String),
  #[error("输出缓冲区大小不匹配: 预期 {expected} 实际 {actual}")]
  OutputSizeMismatch { expected: usize, actual: usize },
  #[error("编译时未启用 NPU 后端特性")]
  BackendUnavailable,
}

/// 模型输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
  /// 设备侧 NMS，单输出
  Nms,
  /// 原始多尺度输出，主机侧解码
  RawYolo,
}

/// 模型加载时从设备元数据推导的描述符，加载后不变
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
  pub input_width: i32,
  pub input_height: i32,
  pub batch_size: usize,
  pub output_kind: OutputKind,
  pub num_classes: usize,
  pub max_bboxes_per_class: usize,
}

/// 发射检测时使用的标注上下文；纯元数据，可随时更新
#[derive(Debug, Clone)]
pub struct ModelRuntime {
  /// "det" 或 "pose"
  pub task: String,
  pub num_keypoints: usize,
  pub labels: Vec<String>,
}

impl Default for ModelRuntime {
  fn default() -> Self {
    Self { task: "det".to_string(), num_keypoints: 0, labels: Vec::new() }
  }
}

/// 批量推理的单帧输入
pub struct BatchFrameInput {
  pub stream_id: String,
  pub rgb: Vec<u8>,
  pub width: i32,
  pub height: i32,
}

/// 设备侧状态：网络句柄 + 预分配缓冲区，由模型互斥锁保护
struct DeviceState {
  network: Box<dyn NpuNetwork>,
  input_buffer: Vec<u8>,
  output_buffers: Vec<Vec<f32>>,
  outputs: Vec<OutputInfo>,
}

/// 一个已加载并配置完成的模型
pub struct NpuModel {
  path: String,
  descriptor: ModelDescriptor,
  runtime: RwLock<ModelRuntime>,
  state: Mutex<DeviceState>,
  batch: Mutex<Option<Arc<BatchScheduler>>>,
  /// 致命错误后置 false，句柄不再接受推理
  usable: AtomicBool,
}

impl NpuModel {
  fn from_network(path: &str, network: Box<dyn NpuNetwork>) -> Result<Self, NpuError> {
    let outputs = network.outputs().to_vec();
    if outputs.is_empty() {
      return Err(NpuError::ModelLoad(format!("模型 {} 没有输出流", path)));
    }

    let nms_meta = outputs[0].nms;
    let output_kind = if outputs.len() > 1 { OutputKind::RawYolo } else { OutputKind::Nms };

    let descriptor = ModelDescriptor {
      input_width: network.input_width(),
      input_height: network.input_height(),
      batch_size: network.batch_size().max(1),
      output_kind,
      num_classes: nms_meta.map(|m| m.num_classes).unwrap_or(DEFAULT_NUM_CLASSES),
      max_bboxes_per_class: nms_meta.map(|m| m.max_bboxes_per_class).unwrap_or(DEFAULT_MAX_BBOXES),
    };

    let input_size = (descriptor.input_width * descriptor.input_height * 3) as usize;
    let output_buffers = outputs.iter().map(|o| vec![0.0f32; o.len]).collect();

    info!(
      "模型 {} 就绪: 输入 {}x{}, batch={}, 输出流 {} 个 ({:?})",
      path,
      descriptor.input_width,
      descriptor.input_height,
      descriptor.batch_size,
      outputs.len(),
      descriptor.output_kind
    );

    Ok(Self {
      path: path.to_string(),
      descriptor: descriptor.clone(),
      runtime: RwLock::new(ModelRuntime::default()),
      state: Mutex::new(DeviceState {
        network,
        input_buffer: vec![0u8; input_size],
        output_buffers,
        outputs,
      }),
      batch: Mutex::new(None),
      usable: AtomicBool::new(true),
    })
  }

  /// 句柄是否仍然可用；致命错误后为 false
  pub fn is_usable(&self) -> bool {
    self.usable.load(Ordering::SeqCst)
  }

  /// 设备错误分流：输出大小不匹配对该模型致命，其余为瞬时错误
  fn handle_device_error(&self, context: &str, e: NpuError) {
    match e {
      NpuError::OutputSizeMismatch { .. } => {
        if self.usable.swap(false, Ordering::SeqCst) {
          error!("模型 {} {}: {}，句柄标记为不可用", self.path, context, e);
        }
      }
      _ => {
        warn!("模型 {} {}: {}", self.path, context, e);
        thread::sleep(DEVICE_ERROR_BACKOFF);
      }
    }
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn descriptor(&self) -> &ModelDescriptor {
    &self.descriptor
  }

  pub fn batch_size(&self) -> usize {
    self.descriptor.batch_size
  }

  /// 更新标注上下文（任务类型、关键点数、类别标签）
  ///
  /// 只影响检测结果的命名，不会重新配置设备。
  pub fn configure(&self, task: &str, num_keypoints: usize, labels: Vec<String>) {
    let mut runtime = self.runtime.write().unwrap_or_else(|e| e.into_inner());
    runtime.task = if task.is_empty() { "det".to_string() } else { task.to_string() };
    runtime.num_keypoints = num_keypoints;
    runtime.labels = labels;
    info!(
      "模型 {} 标注配置: task={}, keypoints={}, labels={}",
      self.path,
      runtime.task,
      runtime.num_keypoints,
      runtime.labels.len()
    );
  }

  /// 单帧推理
  pub fn run_single(
    &self,
    rgb: &[u8],
    width: i32,
    height: i32,
    confidence_threshold: f32,
  ) -> Vec<Detection> {
    if !self.is_usable() {
      debug!("模型 {} 已不可用，跳过推理", self.path);
      return Vec::new();
    }

    let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let st = &mut *guard;

    let letterbox = prepare_input(&self.descriptor, &mut st.input_buffer, rgb, width, height);

    if let Err(e) = st.network.write_input(&st.input_buffer) {
      self.handle_device_error("输入写入失败", e);
      return Vec::new();
    }

    // 每帧必须读完所有输出流，否则设备积压超时
    if let Err(e) = st.network.read_outputs(&mut st.output_buffers) {
      self.handle_device_error("输出读取失败", e);
      return Vec::new();
    }

    let runtime = self.runtime.read().unwrap_or_else(|e| e.into_inner());
    self.parse_outputs(st, &runtime, confidence_threshold, width, height, &letterbox)
  }

  /// 批量推理：恰好 batch_size 次写入后跟随等量读取
  ///
  /// 不足 batch_size 的部分用灰色帧补齐以满足设备的事务约定。
  /// 返回按 stream_id 索引的检测结果。
  pub fn run_batch(
    &self,
    frames: &[BatchFrameInput],
    confidence_threshold: f32,
  ) -> HashMap<String, Vec<Detection>> {
    let mut results = HashMap::new();
    if frames.is_empty() {
      return results;
    }
    if !self.is_usable() {
      debug!("模型 {} 已不可用，跳过批量推理", self.path);
      return results;
    }

    let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let st = &mut *guard;

    let batch_size = self.descriptor.batch_size;
    let actual = frames.len().min(batch_size);
    let mut letterboxes = Vec::with_capacity(actual);

    for i in 0..batch_size {
      if i < actual {
        let frame = &frames[i];
        let lb = prepare_input(&self.descriptor, &mut st.input_buffer, &frame.rgb, frame.width, frame.height);
        letterboxes.push(lb);
      } else {
        // 补齐帧：纯灰色
        st.input_buffer.fill(LETTERBOX_PAD_VALUE);
      }

      if let Err(e) = st.network.write_input(&st.input_buffer) {
        self.handle_device_error(&format!("批量写入第 {} 帧失败", i), e);
        return results;
      }
    }

    let runtime = self.runtime.read().unwrap_or_else(|e| e.into_inner());

    for (i, frame) in frames.iter().take(actual).enumerate() {
      if let Err(e) = st.network.read_outputs(&mut st.output_buffers) {
        self.handle_device_error(&format!("批量读取第 {} 帧失败", i), e);
        return results;
      }

      let detections = self.parse_outputs(
        st,
        &runtime,
        confidence_threshold,
        frame.width,
        frame.height,
        &letterboxes[i],
      );
      results.insert(frame.stream_id.clone(), detections);
    }

    results
  }

  fn parse_outputs(
    &self,
    st: &DeviceState,
    runtime: &ModelRuntime,
    confidence_threshold: f32,
    frame_width: i32,
    frame_height: i32,
    letterbox: &LetterboxInfo,
  ) -> Vec<Detection> {
    match self.descriptor.output_kind {
      OutputKind::Nms => postprocess::parse_nms_output(
        &st.output_buffers[0],
        &self.descriptor,
        runtime,
        confidence_threshold,
        frame_width,
        frame_height,
        letterbox,
      ),
      OutputKind::RawYolo => postprocess::parse_raw_yolo(
        &st.output_buffers,
        &st.outputs,
        &self.descriptor,
        runtime,
        confidence_threshold,
        RAW_YOLO_IOU_THRESHOLD,
        frame_width,
        frame_height,
        letterbox,
      ),
    }
  }

  /// 按需创建该模型的批量调度器（batch_size > 1 时）
  pub fn batch_scheduler(
    self: &Arc<Self>,
    batch_timeout_ms: u64,
    confidence_threshold: f32,
  ) -> Option<Arc<BatchScheduler>> {
    if self.descriptor.batch_size <= 1 {
      return None;
    }

    let mut guard = self.batch.lock().unwrap_or_else(|e| e.into_inner());
    if guard.is_none() {
      let scheduler = BatchScheduler::start(Arc::clone(self), batch_timeout_ms, confidence_threshold);
      info!("模型 {} 批量调度器启动, batch={}", self.path, self.descriptor.batch_size);
      *guard = Some(scheduler);
    }
    guard.clone()
  }

  /// 停止批量调度器（清空队列后退出）
  pub fn stop_batch_scheduler(&self) {
    let scheduler = self.batch.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(s) = scheduler {
      s.stop();
    }
  }
}

/// 把输入帧装入模型输入缓冲区，返回逆映射信息
fn prepare_input(
  desc: &ModelDescriptor,
  input_buffer: &mut [u8],
  rgb: &[u8],
  width: i32,
  height: i32,
) -> LetterboxInfo {
  if width != desc.input_width || height != desc.input_height {
    letterbox_resize(rgb, width, height, input_buffer, desc.input_width, desc.input_height, LETTERBOX_PAD_VALUE)
  } else {
    let n = input_buffer.len().min(rgb.len());
    input_buffer[..n].copy_from_slice(&rgb[..n]);
    LetterboxInfo::identity(width, height)
  }
}

/// 进程级推理引擎：模型路径 → 共享模型句柄
pub struct NpuEngine {
  models: Mutex<HashMap<String, Arc<NpuModel>>>,
}

impl NpuEngine {
  pub fn new() -> Arc<Self> {
    Arc::new(Self { models: Mutex::new(HashMap::new()) })
  }

  /// 加载模型；同一路径返回同一句柄
  ///
  /// 缓存中的句柄若已因致命错误失效，先剔除再重新加载。
  pub fn get_or_load(&self, path: &str) -> Result<Arc<NpuModel>, NpuError> {
    let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(model) = Self::take_usable(&mut models, path) {
      return Ok(model);
    }

    let network = device::open_network(path)?;
    let model = Arc::new(NpuModel::from_network(path, network)?);
    models.insert(path.to_string(), Arc::clone(&model));
    Ok(model)
  }

  /// 用外部提供的网络加载模型（测试注入）
  pub fn get_or_load_with(
    &self,
    path: &str,
    network: Box<dyn NpuNetwork>,
  ) -> Result<Arc<NpuModel>, NpuError> {
    let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(model) = Self::take_usable(&mut models, path) {
      return Ok(model);
    }

    let model = Arc::new(NpuModel::from_network(path, network)?);
    models.insert(path.to_string(), Arc::clone(&model));
    Ok(model)
  }

  /// 返回缓存中仍可用的句柄；失效句柄当场剔除
  fn take_usable(
    models: &mut HashMap<String, Arc<NpuModel>>,
    path: &str,
  ) -> Option<Arc<NpuModel>> {
    let cached = models.get(path).map(Arc::clone)?;
    if cached.is_usable() {
      return Some(cached);
    }

    models.remove(path);
    cached.stop_batch_scheduler();
    warn!("模型 {} 句柄已失效，从缓存剔除", path);
    None
  }

  /// 显式释放模型；仍被流持有的句柄在最后一个引用消失后回收
  pub fn release(&self, path: &str) {
    let removed = {
      let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());
      models.remove(path)
    };
    if let Some(model) = removed {
      model.stop_batch_scheduler();
      info!("模型 {} 已从引擎卸载", path);
    }
  }

  pub fn loaded_count(&self) -> usize {
    self.models.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  /// 停止全部批量调度器并清空模型缓存
  pub fn shutdown(&self) {
    let models: Vec<Arc<NpuModel>> = {
      let mut guard = self.models.lock().unwrap_or_else(|e| e.into_inner());
      guard.drain().map(|(_, m)| m).collect()
    };
    for model in models {
      model.stop_batch_scheduler();
    }
    info!("NPU 引擎已关闭");
  }
}
