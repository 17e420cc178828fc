// 该文件是 Tianmu （天目） 项目的一部分。
// src/registry.rs - 模型包注册表
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 模型包注册表
//!
//! 磁盘布局 `{models_dir}/{model_id}/{model.hef, model_config.json}`。
//! 安装接收 ZIP 字节流：只抽取这两个已知文件（忽略包内目录层级），
//! 解析配置后整目录落盘。使用中的模型（usage_count > 0）拒绝覆盖与删除。

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::types::now_timestamp_ms;

const MODEL_HEF_FILE: &str = "model.hef";
const MODEL_CONFIG_FILE: &str = "model_config.json";

#[derive(Error, Debug)]
pub enum RegistryError {
  #[error("模型 {0} 不存在")]
  NotFound(String),
  #[error("模型 {model_id} 已存在，需要 overwrite=true 才能覆盖")]
  AlreadyExists { model_id: String },
  #[error("模型 {model_id} 正在被 {count} 条流使用")]
  InUse { model_id: String, count: u32 },
  #[error("模型包无效: {0}")]
  InvalidPackage(String),
  #[error("模型配置无效: {0}")]
  InvalidConfig(String),
  #[error("IO 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("ZIP 错误: {0}")]
  Zip(#[from] zip::result::ZipError),
}

/// 模型输出声明（model_config.json 的 outputs 数组）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelOutput {
  pub label: String,
  #[serde(default)]
  pub classifiers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ModelConfigFile {
  id: String,
  #[serde(default)]
  name: Option<String>,
  #[serde(default)]
  version: Option<String>,
  #[serde(default)]
  date: Option<String>,
  #[serde(default)]
  task: Option<String>,
  #[serde(default)]
  num_keypoints: Option<u32>,
  #[serde(default)]
  labels: Option<Vec<String>>,
  #[serde(default)]
  outputs: Option<Vec<ModelOutput>>,
  #[serde(default)]
  description: Option<String>,
  #[serde(default)]
  function_name: Option<String>,
  #[serde(default)]
  post_process_so: Option<String>,
}

/// 已注册模型的完整信息
#[derive(Debug, Clone, Default)]
pub struct ModelInfo {
  pub model_id: String,
  pub name: String,
  pub version: String,
  pub date: String,
  /// "det" 或 "pose"
  pub task: String,
  pub hef_path: String,
  pub function_name: String,
  pub post_process_so: String,
  pub labels: Vec<String>,
  pub outputs: Vec<ModelOutput>,
  pub description: String,
  pub num_keypoints: u32,
  pub registered_at: i64,
  pub model_dir: PathBuf,
  pub usage_count: u32,
}

/// 并发安全的模型注册表
pub struct ModelRegistry {
  models_dir: PathBuf,
  models: Mutex<HashMap<String, ModelInfo>>,
}

impl ModelRegistry {
  pub fn new<P: Into<PathBuf>>(models_dir: P) -> Self {
    Self { models_dir: models_dir.into(), models: Mutex::new(HashMap::new()) }
  }

  /// 创建模型目录并扫描已有模型
  pub fn initialize(&self) -> Result<(), RegistryError> {
    if !self.models_dir.exists() {
      fs::create_dir_all(&self.models_dir)?;
      info!("已创建模型目录: {}", self.models_dir.display());
    }

    let count = self.scan_models()?;
    info!("模型注册表初始化完成, 已注册 {} 个模型", count);
    Ok(())
  }

  /// 重新扫描模型目录
  pub fn rescan(&self) -> Result<usize, RegistryError> {
    let count = self.scan_models()?;
    info!("重新扫描模型目录, 发现 {} 个模型", count);
    Ok(count)
  }

  fn scan_models(&self) -> Result<usize, RegistryError> {
    let mut found = HashMap::new();

    for entry in fs::read_dir(&self.models_dir)? {
      let entry = entry?;
      let path = entry.path();
      if !path.is_dir() {
        continue;
      }
      // 跳过安装残留的临时目录
      if entry.file_name().to_string_lossy().starts_with('.') {
        continue;
      }

      match self.load_model_from_dir(&path) {
        Ok(info) => {
          found.insert(info.model_id.clone(), info);
        }
        Err(e) => {
          warn!("目录 {} 不是有效模型: {}", path.display(), e);
        }
      }
    }

    let count = found.len();
    let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());
    // 保留已有用量计数
    for (id, info) in found.iter_mut() {
      if let Some(old) = models.get(id) {
        info.usage_count = old.usage_count;
      }
    }
    *models = found;
    Ok(count)
  }

  /// 从 ZIP 字节流安装模型，返回 model_id
  pub fn install_model(&self, zip_data: &[u8], overwrite: bool) -> Result<String, RegistryError> {
    let temp_dir = self.models_dir.join(format!(".temp_{}", now_timestamp_ms()));
    fs::create_dir_all(&temp_dir)?;

    let result = self.install_into_temp(zip_data, overwrite, &temp_dir);
    if result.is_err() {
      let _ = fs::remove_dir_all(&temp_dir);
    }
    result
  }

  fn install_into_temp(
    &self,
    zip_data: &[u8],
    overwrite: bool,
    temp_dir: &Path,
  ) -> Result<String, RegistryError> {
    let config = extract_package(zip_data, temp_dir)?;
    let model_id = config.id.clone();

    {
      let models = self.models.lock().unwrap_or_else(|e| e.into_inner());
      if let Some(existing) = models.get(&model_id) {
        if !overwrite {
          return Err(RegistryError::AlreadyExists { model_id });
        }
        if existing.usage_count > 0 {
          return Err(RegistryError::InUse { model_id, count: existing.usage_count });
        }
      }
    }

    let model_dir = self.models_dir.join(&model_id);
    if model_dir.exists() {
      fs::remove_dir_all(&model_dir)?;
    }

    // 跨文件系统时 rename 可能失败，回退到复制
    if fs::rename(temp_dir, &model_dir).is_err() {
      fs::create_dir_all(&model_dir)?;
      for entry in fs::read_dir(temp_dir)? {
        let entry = entry?;
        fs::copy(entry.path(), model_dir.join(entry.file_name()))?;
      }
      fs::remove_dir_all(temp_dir)?;
    }

    let info = build_model_info(config, &model_dir);
    let id = info.model_id.clone();
    self.models.lock().unwrap_or_else(|e| e.into_inner()).insert(id.clone(), info);

    info!("模型已安装: {} -> {}", id, model_dir.display());
    Ok(id)
  }

  /// 删除模型；force=false 时使用中的模型拒绝删除
  pub fn uninstall_model(&self, model_id: &str, force: bool) -> Result<(), RegistryError> {
    let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());

    let info = models
      .get(model_id)
      .ok_or_else(|| RegistryError::NotFound(model_id.to_string()))?;

    if info.usage_count > 0 && !force {
      return Err(RegistryError::InUse { model_id: model_id.to_string(), count: info.usage_count });
    }

    fs::remove_dir_all(&info.model_dir)?;
    models.remove(model_id);
    info!("模型已删除: {}", model_id);
    Ok(())
  }

  pub fn get_model(&self, model_id: &str) -> Option<ModelInfo> {
    self.models.lock().unwrap_or_else(|e| e.into_inner()).get(model_id).cloned()
  }

  pub fn all_models(&self) -> Vec<ModelInfo> {
    let models = self.models.lock().unwrap_or_else(|e| e.into_inner());
    let mut list: Vec<ModelInfo> = models.values().cloned().collect();
    list.sort_by(|a, b| a.model_id.cmp(&b.model_id));
    list
  }

  pub fn has_model(&self, model_id: &str) -> bool {
    self.models.lock().unwrap_or_else(|e| e.into_inner()).contains_key(model_id)
  }

  pub fn model_count(&self) -> usize {
    self.models.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn hef_path(&self, model_id: &str) -> Option<String> {
    self.get_model(model_id).map(|m| m.hef_path)
  }

  pub fn increment_usage(&self, model_id: &str) {
    let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(info) = models.get_mut(model_id) {
      info.usage_count += 1;
    }
  }

  pub fn decrement_usage(&self, model_id: &str) {
    let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(info) = models.get_mut(model_id) {
      if info.usage_count > 0 {
        info.usage_count -= 1;
      }
    }
  }

  fn load_model_from_dir(&self, model_dir: &Path) -> Result<ModelInfo, RegistryError> {
    let config_path = model_dir.join(MODEL_CONFIG_FILE);
    let hef_path = model_dir.join(MODEL_HEF_FILE);

    if !config_path.exists() {
      return Err(RegistryError::InvalidPackage(format!("缺少 {}", MODEL_CONFIG_FILE)));
    }
    if !hef_path.exists() {
      return Err(RegistryError::InvalidPackage(format!("缺少 {}", MODEL_HEF_FILE)));
    }

    let content = fs::read_to_string(&config_path)?;
    let config = parse_model_config(&content)?;
    Ok(build_model_info(config, model_dir))
  }
}

/// 只抽取 model.hef 与 model_config.json；两者缺一不可
fn extract_package(zip_data: &[u8], temp_dir: &Path) -> Result<ModelConfigFile, RegistryError> {
  let mut archive = zip::ZipArchive::new(Cursor::new(zip_data))?;

  let mut has_hef = false;
  let mut has_config = false;

  for i in 0..archive.len() {
    let mut file = archive.by_index(i)?;
    let name = file.name().to_string();
    if name.ends_with('/') {
      continue;
    }

    // 忽略包内目录结构，只看文件名
    let basename = name.rsplit('/').next().unwrap_or(&name).to_string();
    if basename != MODEL_HEF_FILE && basename != MODEL_CONFIG_FILE {
      continue;
    }

    let mut content = Vec::new();
    file.read_to_end(&mut content)?;

    let out_path = temp_dir.join(&basename);
    let mut out = fs::File::create(&out_path)?;
    out.write_all(&content)?;

    if basename == MODEL_HEF_FILE {
      has_hef = true;
    } else {
      has_config = true;
    }
  }

  if !has_hef {
    return Err(RegistryError::InvalidPackage(format!("ZIP 中必须包含 {}", MODEL_HEF_FILE)));
  }
  if !has_config {
    return Err(RegistryError::InvalidPackage(format!("ZIP 中必须包含 {}", MODEL_CONFIG_FILE)));
  }

  let content = fs::read_to_string(temp_dir.join(MODEL_CONFIG_FILE))?;
  parse_model_config(&content)
}

fn parse_model_config(content: &str) -> Result<ModelConfigFile, RegistryError> {
  let config: ModelConfigFile =
    serde_json::from_str(content).map_err(|e| RegistryError::InvalidConfig(e.to_string()))?;

  if config.id.is_empty() {
    return Err(RegistryError::InvalidConfig("id 不能为空".to_string()));
  }
  Ok(config)
}

fn build_model_info(config: ModelConfigFile, model_dir: &Path) -> ModelInfo {
  let outputs = config.outputs.unwrap_or_default();

  // 未显式给出 labels 时从 outputs 提取
  let labels = match config.labels {
    Some(labels) if !labels.is_empty() => labels,
    _ => outputs.iter().map(|o| o.label.clone()).collect(),
  };

  ModelInfo {
    name: config.name.unwrap_or_else(|| config.id.clone()),
    model_id: config.id,
    version: config.version.unwrap_or_default(),
    date: config.date.unwrap_or_default(),
    task: config.task.filter(|t| !t.is_empty()).unwrap_or_else(|| "det".to_string()),
    hef_path: model_dir.join(MODEL_HEF_FILE).to_string_lossy().into_owned(),
    function_name: config.function_name.unwrap_or_else(|| "yolov8".to_string()),
    post_process_so: config.post_process_so.unwrap_or_default(),
    labels,
    outputs,
    description: config.description.unwrap_or_default(),
    num_keypoints: config.num_keypoints.unwrap_or(0),
    registered_at: now_timestamp_ms(),
    model_dir: model_dir.to_path_buf(),
    usage_count: 0,
  }
}
