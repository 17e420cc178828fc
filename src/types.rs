// 该文件是 Tianmu （天目） 项目的一部分。
// src/types.rs - 公共数据类型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use serde::ser::{SerializeSeq, Serializer};
use serde::Serialize;

/// 默认最大流数量
pub const DEFAULT_MAX_STREAMS: usize = 4;
/// 重连基础延迟（秒）
pub const RECONNECT_DELAY_SECONDS: u32 = 3;
/// 重连最大尝试次数
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// 默认置信度阈值
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// 流状态机状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
  Starting,
  Running,
  Stopped,
  Error,
  Reconnecting,
}

impl StreamState {
  pub fn as_str(&self) -> &'static str {
    match self {
      StreamState::Starting => "STARTING",
      StreamState::Running => "RUNNING",
      StreamState::Stopped => "STOPPED",
      StreamState::Error => "ERROR",
      StreamState::Reconnecting => "RECONNECTING",
    }
  }
}

impl std::fmt::Display for StreamState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 边界框（原始帧像素坐标系）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BoundingBox {
  pub x: i32,
  pub y: i32,
  pub width: i32,
  pub height: i32,
}

/// 关键点（原始帧归一化坐标 0.0~1.0）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Keypoint {
  pub x: f32,
  pub y: f32,
  /// 可见度/置信度（0.0~1.0）
  pub visible: f32,
}

/// 单个检测结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct Detection {
  #[serde(rename = "class")]
  pub class_name: String,
  pub class_id: u16,
  pub confidence: f32,
  pub bbox: BoundingBox,
  /// 该对象命中的事件设置（复数 ROI 支持）；线上报文只带首个
  #[serde(rename = "event", serialize_with = "ser_first_event")]
  pub event_setting_ids: Vec<String>,
  /// 姿态关键点（仅 pose 模型）
  #[serde(skip_serializing_if = "Vec::is_empty", serialize_with = "ser_keypoints")]
  pub keypoints: Vec<Keypoint>,
}

fn ser_first_event<S: Serializer>(ids: &[String], s: S) -> Result<S::Ok, S::Error> {
  match ids.first() {
    Some(id) => s.serialize_some(id),
    None => s.serialize_none(),
  }
}

fn ser_keypoints<S: Serializer>(kps: &[Keypoint], s: S) -> Result<S::Ok, S::Error> {
  let mut seq = s.serialize_seq(Some(kps.len()))?;
  for kp in kps {
    seq.serialize_element(&[kp.x, kp.y, kp.visible])?;
  }
  seq.end()
}

/// 事件状态（0=SAFE/NONE, 1=WARNING, 2=DANGER/ALARM）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStatus {
  pub status: i32,
  pub labels: Vec<String>,
}

/// 每帧结果信封，经消息总线发布
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionEvent {
  pub stream_id: String,
  /// Unix 毫秒时间戳
  pub timestamp: i64,
  pub frame_number: u64,
  pub fps: f64,
  pub width: i32,
  pub height: i32,
  pub detections: Vec<Detection>,
  /// 规则 ID → 事件状态
  #[serde(skip_serializing_if = "HashMap::is_empty")]
  pub events: HashMap<String, EventStatus>,
  /// JPEG 快照（Base64 编码）
  #[serde(skip_serializing_if = "Option::is_none", serialize_with = "ser_image")]
  pub image: Option<Vec<u8>>,
}

fn ser_image<S: Serializer>(data: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
  match data {
    Some(bytes) => s.serialize_some(&base64::engine::general_purpose::STANDARD.encode(bytes)),
    None => s.serialize_none(),
  }
}

/// 单路流的运行参数
#[derive(Debug, Clone, PartialEq, serde::Deserialize, Serialize)]
pub struct StreamConfig {
  pub width: i32,
  pub height: i32,
  pub fps: i32,
  pub confidence_threshold: f32,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      width: 1920,
      height: 1080,
      fps: 30,
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
    }
  }
}

/// 流描述符：添加/更新流时的完整配置
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
  pub stream_id: String,
  pub source_url: String,
  /// 模型文件路径；为空表示纯视频流（无推理）
  pub model_path: String,
  /// 模型注册 ID（用于查询与用量统计）
  pub model_id: String,
  pub config: StreamConfig,
  /// "det" 或 "pose"
  pub task: String,
  pub num_keypoints: u32,
  pub labels: Vec<String>,
}

/// 流运行状态快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStatus {
  pub stream_id: String,
  pub source_url: String,
  pub model_id: String,
  pub state: String,
  pub frame_count: u64,
  pub current_fps: f64,
  pub uptime_seconds: u64,
  pub last_error: String,
  pub last_detection_time: i64,
}

/// 检测回调
pub type DetectionCallback = Arc<dyn Fn(&DetectionEvent) + Send + Sync>;
/// 状态变更回调
pub type StateChangeCallback = Arc<dyn Fn(&str, StreamState) + Send + Sync>;
/// 错误回调
pub type ErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// 当前 Unix 毫秒时间戳
pub fn now_timestamp_ms() -> i64 {
  chrono::Utc::now().timestamp_millis()
}
