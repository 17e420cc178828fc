// 该文件是 Tianmu （天目） 项目的一部分。
// src/config.rs - 守护进程配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 守护进程配置
//!
//! YAML 文件分节：`nats` / `stream` / `npu` / `log` /
//! `performance` / `models`。缺省字段取内置默认值，
//! `--generate-config` 可输出完整默认配置。

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::WorkerOptions;
use crate::types::{StreamConfig, DEFAULT_MAX_STREAMS};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取配置文件: {0}")]
  Io(#[from] std::io::Error),
  #[error("YAML 解析失败: {0}")]
  Yaml(#[from] serde_yaml::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
}

/// 消息总线配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NatsConfig {
  pub url: String,
  pub auto_reconnect: bool,
  pub reconnect_interval_seconds: u64,
  /// 0 表示不限次数
  pub max_reconnect_attempts: u32,
}

impl Default for NatsConfig {
  fn default() -> Self {
    Self {
      url: "nats://localhost:4222".to_string(),
      auto_reconnect: true,
      reconnect_interval_seconds: 5,
      max_reconnect_attempts: 0,
    }
  }
}

/// 流默认参数
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DefaultStreamConfig {
  pub width: i32,
  pub height: i32,
  pub fps: i32,
  pub confidence_threshold: f32,
  /// 信封是否随帧附带 JPEG 快照
  pub publish_images: bool,
  pub jpeg_quality: u8,
}

impl Default for DefaultStreamConfig {
  fn default() -> Self {
    Self {
      width: 1920,
      height: 1080,
      fps: 30,
      confidence_threshold: 0.5,
      publish_images: false,
      jpeg_quality: 80,
    }
  }
}

/// NPU 推理配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NpuConfig {
  /// 批量收集超时（毫秒）
  pub batch_timeout_ms: u64,
}

impl Default for NpuConfig {
  fn default() -> Self {
    Self { batch_timeout_ms: crate::batch::DEFAULT_BATCH_TIMEOUT_MS }
  }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
  pub level: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self { level: "info".to_string() }
  }
}

/// 运行时限额与 RTSP 调优
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PerformanceConfig {
  pub max_streams: usize,
  pub rtsp_latency_ms: u32,
  pub rtsp_timeout_us: u64,
  pub rtsp_retry: u32,
}

impl Default for PerformanceConfig {
  fn default() -> Self {
    Self {
      max_streams: DEFAULT_MAX_STREAMS,
      rtsp_latency_ms: 0,
      rtsp_timeout_us: 10_000_000,
      rtsp_retry: 3,
    }
  }
}

/// 模型存储配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelStorageConfig {
  pub models_dir: String,
}

impl Default for ModelStorageConfig {
  fn default() -> Self {
    Self { models_dir: "./models".to_string() }
  }
}

/// 守护进程总配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
  pub nats: NatsConfig,
  pub stream: DefaultStreamConfig,
  pub npu: NpuConfig,
  pub log: LogConfig,
  pub performance: PerformanceConfig,
  pub models: ModelStorageConfig,
}

impl DaemonConfig {
  pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let content = fs::read_to_string(path)?;
    Self::load_from_str(&content)
  }

  pub fn load_from_str(yaml: &str) -> Result<Self, ConfigError> {
    let config: DaemonConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
  }

  pub fn to_yaml_string(&self) -> String {
    serde_yaml::to_string(self).unwrap_or_default()
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.nats.url.is_empty() {
      return Err(ConfigError::Invalid("NATS URL 不能为空".to_string()));
    }
    if self.nats.reconnect_interval_seconds < 1 {
      return Err(ConfigError::Invalid("NATS 重连间隔至少 1 秒".to_string()));
    }
    if self.stream.width <= 0 || self.stream.height <= 0 {
      return Err(ConfigError::Invalid("流宽高必须为正".to_string()));
    }
    if self.stream.fps <= 0 || self.stream.fps > 120 {
      return Err(ConfigError::Invalid("流帧率必须在 1~120 之间".to_string()));
    }
    if !(0.0..=1.0).contains(&self.stream.confidence_threshold) {
      return Err(ConfigError::Invalid("置信度阈值必须在 0.0~1.0 之间".to_string()));
    }
    if self.stream.jpeg_quality == 0 || self.stream.jpeg_quality > 100 {
      return Err(ConfigError::Invalid("JPEG 质量必须在 1~100 之间".to_string()));
    }
    if self.npu.batch_timeout_ms == 0 {
      return Err(ConfigError::Invalid("批量超时必须大于 0".to_string()));
    }
    if self.performance.max_streams < 1 || self.performance.max_streams > 16 {
      return Err(ConfigError::Invalid("最大流数量必须在 1~16 之间".to_string()));
    }
    Ok(())
  }

  /// 流默认参数（每路流可被控制面覆盖）
  pub fn stream_config(&self) -> StreamConfig {
    StreamConfig {
      width: self.stream.width,
      height: self.stream.height,
      fps: self.stream.fps,
      confidence_threshold: self.stream.confidence_threshold,
    }
  }

  /// 工作器运行参数
  pub fn worker_options(&self) -> WorkerOptions {
    WorkerOptions {
      rtsp_latency_ms: self.performance.rtsp_latency_ms,
      rtsp_timeout_us: self.performance.rtsp_timeout_us,
      rtsp_retry: self.performance.rtsp_retry,
      jpeg_quality: self.stream.jpeg_quality,
      publish_images: self.stream.publish_images,
      batch_timeout_ms: self.npu.batch_timeout_ms,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_config_valid() {
    let config = DaemonConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.performance.max_streams, 4);
    assert_eq!(config.npu.batch_timeout_ms, 50);
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let yaml = r#"
nats:
  url: "nats://10.0.0.5:4222"
performance:
  max_streams: 8
"#;
    let config = DaemonConfig::load_from_str(yaml).unwrap();
    assert_eq!(config.nats.url, "nats://10.0.0.5:4222");
    assert_eq!(config.performance.max_streams, 8);
    // 未覆盖的分节保持默认
    assert_eq!(config.stream.width, 1920);
    assert_eq!(config.models.models_dir, "./models");
  }

  #[test]
  fn test_generated_yaml_round_trip() {
    let config = DaemonConfig::default();
    let yaml = config.to_yaml_string();
    let parsed = DaemonConfig::load_from_str(&yaml).unwrap();
    assert_eq!(parsed.nats.url, config.nats.url);
    assert_eq!(parsed.stream.jpeg_quality, config.stream.jpeg_quality);
  }

  #[test]
  fn test_invalid_values_rejected() {
    let yaml = "stream:\n  fps: 500\n";
    assert!(DaemonConfig::load_from_str(yaml).is_err());

    let yaml = "performance:\n  max_streams: 0\n";
    assert!(DaemonConfig::load_from_str(yaml).is_err());

    let yaml = "stream:\n  confidence_threshold: 1.5\n";
    assert!(DaemonConfig::load_from_str(yaml).is_err());
  }
}
