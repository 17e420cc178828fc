// 该文件是 Tianmu （天目） 项目的一部分。
// src/event.rs - 事件合成器
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 事件合成器
//!
//! 声明式规则集（JSON）按帧评估：
//! - ROI 规则给命中的检测打事件 ID 标签（允许多规则命中）；
//! - Line 规则由关键点驱动，输出 SAFE/WARNING/DANGER 状态；
//! - AngleViolation 规则比较关键点连线与基准线的夹角；
//! - And/Or/Speed/EnEx/Alarm/HM 解析并保留在规则树中，
//!   评估恒为 SAFE，待后续跟踪子系统提供时序输入。
//!
//! 规则树是以 parent_id 连接的森林；终端规则 = 无子节点且
//! 类型不是 Filter/HM 的叶子，其 ID 在更新时返回给控制端。

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::geometry::{point_in_polygon, point_line_distance, signed_side};
use crate::types::{Detection, EventStatus};

/// 关键点可见度门限，低于此值不参与线/角评估
const VISIBILITY_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum EventError {
  #[error("事件设置 JSON 解析失败: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("事件设置无效: {0}")]
  Invalid(String),
}

/// 规则类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
  Roi,
  Line,
  AngleViolation,
  And,
  Or,
  Filter,
  Speed,
  Hm,
  EnEx,
  Alarm,
  Unknown,
}

impl RuleType {
  fn parse(s: &str) -> Self {
    match s.to_lowercase().as_str() {
      "roi" => RuleType::Roi,
      "line" => RuleType::Line,
      "angleviolation" => RuleType::AngleViolation,
      "and" => RuleType::And,
      "or" => RuleType::Or,
      "filter" => RuleType::Filter,
      "speed" => RuleType::Speed,
      "hm" => RuleType::Hm,
      "enex" => RuleType::EnEx,
      "alarm" => RuleType::Alarm,
      _ => RuleType::Unknown,
    }
  }
}

/// 检测对象的参考点（九宫格）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionPoint {
  LeftTop,
  CenterTop,
  RightTop,
  LeftCenter,
  Center,
  RightCenter,
  LeftBottom,
  CenterBottom,
  RightBottom,
}

impl DetectionPoint {
  fn parse(s: &str) -> Self {
    match s {
      "l:t" => DetectionPoint::LeftTop,
      "c:t" => DetectionPoint::CenterTop,
      "r:t" => DetectionPoint::RightTop,
      "l:c" => DetectionPoint::LeftCenter,
      "c:c" => DetectionPoint::Center,
      "r:c" => DetectionPoint::RightCenter,
      "l:b" => DetectionPoint::LeftBottom,
      "r:b" => DetectionPoint::RightBottom,
      // 默认取脚底位置
      _ => DetectionPoint::CenterBottom,
    }
  }
}

/// 线规则方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDirection {
  A2B,
  B2A,
  Both,
}

impl LineDirection {
  fn parse(s: &str) -> Self {
    match s {
      "A2B" => LineDirection::A2B,
      "B2A" => LineDirection::B2A,
      _ => LineDirection::Both,
    }
  }
}

/// 一条事件规则（坐标均为归一化 0.0~1.0）
#[derive(Debug, Clone)]
pub struct EventRule {
  pub id: String,
  pub name: String,
  pub rule_type: RuleType,
  pub parent_id: String,
  pub points: Vec<(f32, f32)>,
  /// 小写类别标签；空表示匹配所有类别
  pub targets: Vec<String>,
  pub timeout: f32,
  pub detection_point: DetectionPoint,
  pub direction: LineDirection,
  pub keypoint_indices: Vec<usize>,
  pub warning_distance: f32,
  pub angle_threshold: f32,
  pub in_order: bool,
  pub ncond: String,
  pub turn: i32,
  pub regen_interval: f32,
  pub ext: String,
  /// 子规则 ID（运行时构建）
  pub children: Vec<String>,
}

#[derive(Deserialize)]
struct SettingsPayload {
  #[serde(default)]
  #[allow(dead_code)]
  version: Option<String>,
  #[serde(default)]
  configs: Option<Vec<RuleConfig>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RuleConfig {
  event_setting_id: Option<String>,
  event_setting_name: Option<String>,
  event_type: Option<String>,
  parent_id: Option<String>,
  points: Option<Vec<Vec<f32>>>,
  targets: Option<TargetsField>,
  target: Option<LegacyTarget>,
  timeout: Option<f32>,
  detection_point: Option<String>,
  direction: Option<String>,
  keypoints: Option<Vec<i64>>,
  warning_distance: Option<f32>,
  angle_threshold: Option<f32>,
  in_order: Option<bool>,
  ncond: Option<String>,
  turn: Option<i32>,
  regen_interval: Option<f32>,
  ext: Option<String>,
}

/// `targets` 同时接受单个字符串与字符串数组
#[derive(Deserialize)]
#[serde(untagged)]
enum TargetsField {
  One(String),
  Many(Vec<String>),
}

/// 旧版 `target` 对象形式
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LegacyTarget {
  label: Option<String>,
  #[allow(dead_code)]
  class_type: Option<String>,
  #[allow(dead_code)]
  result_label: Option<Vec<String>>,
}

#[derive(Default)]
struct CompositorState {
  rules: BTreeMap<String, EventRule>,
  terminals: Vec<String>,
}

/// 每条流一个事件合成器；单锁串行化更新与按帧评估
#[derive(Default)]
pub struct EventCompositor {
  state: Mutex<CompositorState>,
}

impl EventCompositor {
  pub fn new() -> Self {
    Self::default()
  }

  /// 整体替换规则集，返回终端规则 ID 列表
  pub fn update_settings(&self, settings_json: &str) -> Result<Vec<String>, EventError> {
    let payload: SettingsPayload = serde_json::from_str(settings_json)?;
    let configs = payload
      .configs
      .ok_or_else(|| EventError::Invalid("缺少 configs 数组".to_string()))?;

    let mut rules = BTreeMap::new();
    for config in configs {
      // 没有 ID 的规则直接忽略
      let id = match &config.event_setting_id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => continue,
      };
      rules.insert(id.clone(), build_rule(id, config));
    }

    build_rule_tree(&mut rules);
    let terminals = find_terminals(&rules);

    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    state.rules = rules;
    state.terminals = terminals.clone();

    info!("事件规则已更新: {} 条规则, {} 个终端", state.rules.len(), terminals.len());
    Ok(terminals)
  }

  /// 清空全部规则
  pub fn clear_settings(&self) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    state.rules.clear();
    state.terminals.clear();
    info!("事件规则已清空");
  }

  pub fn setting_count(&self) -> usize {
    self.state.lock().unwrap_or_else(|e| e.into_inner()).rules.len()
  }

  pub fn terminal_ids(&self) -> Vec<String> {
    self.state.lock().unwrap_or_else(|e| e.into_inner()).terminals.clone()
  }

  pub fn get_setting(&self, id: &str) -> Option<EventRule> {
    self.state.lock().unwrap_or_else(|e| e.into_inner()).rules.get(id).cloned()
  }

  /// 按帧评估：ROI 命中写入检测的事件 ID 列表，
  /// 线/角规则返回按规则 ID 索引的状态
  pub fn check_frame(
    &self,
    detections: &mut [Detection],
    frame_width: i32,
    frame_height: i32,
  ) -> HashMap<String, EventStatus> {
    let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let mut events = HashMap::new();

    if state.rules.is_empty() {
      return events;
    }

    for (id, rule) in &state.rules {
      match rule.rule_type {
        RuleType::Roi => {
          for det in detections.iter_mut() {
            if roi_matches(rule, det, frame_width, frame_height) {
              det.event_setting_ids.push(id.clone());
            }
          }
        }
        RuleType::Line => {
          events.insert(id.clone(), evaluate_line(rule, detections));
        }
        RuleType::AngleViolation => {
          events.insert(id.clone(), evaluate_angle(rule, detections));
        }
        // 复合/时序规则暂不评估，恒为 SAFE
        RuleType::And | RuleType::Or | RuleType::Speed | RuleType::EnEx | RuleType::Alarm => {
          events.insert(id.clone(), EventStatus::default());
        }
        RuleType::Filter | RuleType::Hm | RuleType::Unknown => {}
      }
    }

    events
  }
}

fn build_rule(id: String, config: RuleConfig) -> EventRule {
  let points = config
    .points
    .unwrap_or_default()
    .iter()
    .filter(|p| p.len() >= 2)
    .map(|p| (p[0], p[1]))
    .collect();

  EventRule {
    id,
    name: config.event_setting_name.unwrap_or_default(),
    rule_type: config.event_type.as_deref().map(RuleType::parse).unwrap_or(RuleType::Unknown),
    parent_id: config.parent_id.unwrap_or_default(),
    points,
    targets: normalize_targets(config.targets, config.target),
    timeout: config.timeout.unwrap_or(0.0),
    detection_point: config
      .detection_point
      .as_deref()
      .map(DetectionPoint::parse)
      .unwrap_or(DetectionPoint::CenterBottom),
    direction: config.direction.as_deref().map(LineDirection::parse).unwrap_or(LineDirection::Both),
    keypoint_indices: config
      .keypoints
      .unwrap_or_default()
      .into_iter()
      .filter(|&i| i >= 0)
      .map(|i| i as usize)
      .collect(),
    warning_distance: config.warning_distance.unwrap_or(0.0),
    angle_threshold: config.angle_threshold.unwrap_or(0.0),
    in_order: config.in_order.unwrap_or(false),
    ncond: config.ncond.unwrap_or_default(),
    turn: config.turn.unwrap_or(0),
    regen_interval: config.regen_interval.unwrap_or(60.0),
    ext: config.ext.unwrap_or_default(),
    children: Vec::new(),
  }
}

/// 标签统一小写；"ALL" 等价于空集（匹配所有）
fn normalize_targets(targets: Option<TargetsField>, legacy: Option<LegacyTarget>) -> Vec<String> {
  let raw: Vec<String> = match targets {
    Some(TargetsField::One(s)) => vec![s],
    Some(TargetsField::Many(v)) => v,
    None => legacy.and_then(|t| t.label).map(|l| vec![l]).unwrap_or_default(),
  };

  let mut labels: Vec<String> = raw
    .into_iter()
    .map(|s| s.to_lowercase())
    .filter(|s| !s.is_empty())
    .collect();

  if labels.iter().any(|l| l == "all") {
    labels.clear();
  }
  labels
}

fn build_rule_tree(rules: &mut BTreeMap<String, EventRule>) {
  let links: Vec<(String, String)> = rules
    .values()
    .filter(|r| !r.parent_id.is_empty())
    .map(|r| (r.parent_id.clone(), r.id.clone()))
    .collect();

  for (parent_id, child_id) in links {
    if let Some(parent) = rules.get_mut(&parent_id) {
      parent.children.push(child_id);
    }
  }
}

/// 终端规则：无子节点且类型不是 Filter/HM 的叶子
fn find_terminals(rules: &BTreeMap<String, EventRule>) -> Vec<String> {
  rules
    .values()
    .filter(|r| r.children.is_empty() && r.rule_type != RuleType::Filter && r.rule_type != RuleType::Hm)
    .map(|r| r.id.clone())
    .collect()
}

/// 类别过滤：目标集为空匹配所有；比较不区分大小写
fn matches_target(rule: &EventRule, det: &Detection) -> bool {
  if rule.targets.is_empty() {
    return true;
  }
  let label = det.class_name.to_lowercase();
  rule.targets.iter().any(|t| *t == label)
}

fn roi_matches(rule: &EventRule, det: &Detection, frame_width: i32, frame_height: i32) -> bool {
  if !matches_target(rule, det) {
    return false;
  }
  if rule.points.len() < 3 {
    return false;
  }

  let (px, py) = reference_point(det, rule.detection_point, frame_width, frame_height);
  point_in_polygon(px, py, &rule.points)
}

/// 检测参考点（归一化坐标）
fn reference_point(
  det: &Detection,
  dp: DetectionPoint,
  frame_width: i32,
  frame_height: i32,
) -> (f32, f32) {
  let x = det.bbox.x as f32;
  let y = det.bbox.y as f32;
  let w = det.bbox.width as f32;
  let h = det.bbox.height as f32;

  let (px, py) = match dp {
    DetectionPoint::LeftTop => (x, y),
    DetectionPoint::CenterTop => (x + w / 2.0, y),
    DetectionPoint::RightTop => (x + w, y),
    DetectionPoint::LeftCenter => (x, y + h / 2.0),
    DetectionPoint::Center => (x + w / 2.0, y + h / 2.0),
    DetectionPoint::RightCenter => (x + w, y + h / 2.0),
    DetectionPoint::LeftBottom => (x, y + h),
    DetectionPoint::CenterBottom => (x + w / 2.0, y + h),
    DetectionPoint::RightBottom => (x + w, y + h),
  };

  (px / frame_width as f32, py / frame_height as f32)
}

/// 线规则评估：取所有匹配检测的最大状态
fn evaluate_line(rule: &EventRule, detections: &[Detection]) -> EventStatus {
  let mut result = EventStatus::default();
  if rule.points.len() < 2 {
    return result;
  }

  let (ax, ay) = rule.points[0];
  let (bx, by) = rule.points[1];

  for det in detections {
    if !matches_target(rule, det) {
      continue;
    }

    let mut det_status = 0;
    for (idx, kp) in det.keypoints.iter().enumerate() {
      if !rule.keypoint_indices.is_empty() && !rule.keypoint_indices.contains(&idx) {
        continue;
      }
      if kp.visible < VISIBILITY_THRESHOLD {
        continue;
      }

      let side = signed_side(ax, ay, bx, by, kp.x, kp.y);
      let distance = point_line_distance(ax, ay, bx, by, kp.x, kp.y);

      let status = match rule.direction {
        // 双向线不会产生 DANGER，只按距离给 WARNING
        LineDirection::Both => {
          if distance < rule.warning_distance {
            1
          } else {
            0
          }
        }
        LineDirection::A2B => {
          if side > 0.0 {
            2
          } else if distance < rule.warning_distance {
            1
          } else {
            0
          }
        }
        LineDirection::B2A => {
          if side < 0.0 {
            2
          } else if distance < rule.warning_distance {
            1
          } else {
            0
          }
        }
      };

      det_status = det_status.max(status);
    }

    if det_status > 0 {
      let label = det.class_name.clone();
      if !result.labels.contains(&label) {
        result.labels.push(label);
      }
    }
    result.status = result.status.max(det_status);
  }

  result
}

/// 角度违规评估：关键点 1→2 连线与基准线的锐角夹角超阈值即 DANGER
fn evaluate_angle(rule: &EventRule, detections: &[Detection]) -> EventStatus {
  let mut result = EventStatus::default();
  if rule.points.len() < 2 {
    return result;
  }

  let ux = rule.points[1].0 - rule.points[0].0;
  let uy = rule.points[1].1 - rule.points[0].1;
  let u_len = (ux * ux + uy * uy).sqrt();
  if u_len <= f32::EPSILON {
    return result;
  }

  for det in detections {
    if !matches_target(rule, det) {
      continue;
    }
    if det.keypoints.len() < 3 {
      continue;
    }

    let kp1 = det.keypoints[1];
    let kp2 = det.keypoints[2];
    if kp1.visible < VISIBILITY_THRESHOLD || kp2.visible < VISIBILITY_THRESHOLD {
      continue;
    }

    let vx = kp2.x - kp1.x;
    let vy = kp2.y - kp1.y;
    let v_len = (vx * vx + vy * vy).sqrt();
    if v_len <= f32::EPSILON {
      continue;
    }

    let cos = ((vx * ux + vy * uy) / (v_len * u_len)).clamp(-1.0, 1.0);
    let mut angle = cos.acos().to_degrees();
    // 折到锐角
    angle = angle.min(180.0 - angle);

    if angle > rule.angle_threshold {
      result.status = 2;
      let label = det.class_name.clone();
      if !result.labels.contains(&label) {
        result.labels.push(label);
      }
    }
  }

  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{BoundingBox, Keypoint};

  fn detection(class: &str, bbox: BoundingBox) -> Detection {
    Detection {
      class_name: class.to_string(),
      confidence: 0.9,
      bbox,
      ..Default::default()
    }
  }

  fn roi_payload(targets: &str) -> String {
    format!(
      r#"{{
        "version": "1.0.0",
        "configs": [
          {{
            "eventSettingId": "roi-1",
            "eventSettingName": "区域入侵",
            "eventType": "ROI",
            "points": [[0.1, 0.1], [0.9, 0.1], [0.9, 0.9], [0.1, 0.9]],
            "targets": {},
            "detectionPoint": "c:b"
          }}
        ]
      }}"#,
      targets
    )
  }

  #[test]
  fn test_roi_hit_center_bottom() {
    let compositor = EventCompositor::new();
    compositor.update_settings(&roi_payload(r#"["person"]"#)).unwrap();

    // 640x480 帧, bbox (100,100,200,300) → 参考点 (200,400)/(640,480)
    let mut dets = vec![detection("person", BoundingBox { x: 100, y: 100, width: 200, height: 300 })];
    compositor.check_frame(&mut dets, 640, 480);

    assert_eq!(dets[0].event_setting_ids, vec!["roi-1".to_string()]);
  }

  #[test]
  fn test_roi_miss_by_class_filter() {
    let compositor = EventCompositor::new();
    compositor.update_settings(&roi_payload(r#"["person"]"#)).unwrap();

    let mut dets = vec![detection("car", BoundingBox { x: 100, y: 100, width: 200, height: 300 })];
    compositor.check_frame(&mut dets, 640, 480);

    assert!(dets[0].event_setting_ids.is_empty());
  }

  #[test]
  fn test_roi_all_matches_any_class() {
    let compositor = EventCompositor::new();
    compositor.update_settings(&roi_payload(r#"["ALL"]"#)).unwrap();

    let mut dets = vec![detection("giraffe", BoundingBox { x: 100, y: 100, width: 200, height: 300 })];
    compositor.check_frame(&mut dets, 640, 480);
    assert_eq!(dets[0].event_setting_ids.len(), 1);
  }

  #[test]
  fn test_roi_target_case_insensitive() {
    let compositor = EventCompositor::new();
    compositor.update_settings(&roi_payload(r#"["Person"]"#)).unwrap();

    let mut dets = vec![detection("PERSON", BoundingBox { x: 100, y: 100, width: 200, height: 300 })];
    compositor.check_frame(&mut dets, 640, 480);
    assert_eq!(dets[0].event_setting_ids.len(), 1);
  }

  #[test]
  fn test_roi_multi_tag() {
    // 两个重叠 ROI 都命中时全部打标
    let compositor = EventCompositor::new();
    let payload = r#"{
      "configs": [
        {"eventSettingId": "roi-a", "eventType": "ROI",
         "points": [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]], "targets": ["ALL"]},
        {"eventSettingId": "roi-b", "eventType": "ROI",
         "points": [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]], "targets": ["ALL"]}
      ]
    }"#;
    compositor.update_settings(payload).unwrap();

    let mut dets = vec![detection("person", BoundingBox { x: 100, y: 100, width: 200, height: 100 })];
    compositor.check_frame(&mut dets, 640, 480);
    assert_eq!(dets[0].event_setting_ids.len(), 2);
  }

  #[test]
  fn test_roi_fewer_than_three_points_never_matches() {
    let compositor = EventCompositor::new();
    let payload = r#"{
      "configs": [
        {"eventSettingId": "roi-1", "eventType": "ROI",
         "points": [[0.0, 0.0], [1.0, 1.0]], "targets": ["ALL"]}
      ]
    }"#;
    compositor.update_settings(payload).unwrap();

    let mut dets = vec![detection("person", BoundingBox { x: 100, y: 100, width: 200, height: 100 })];
    compositor.check_frame(&mut dets, 640, 480);
    assert!(dets[0].event_setting_ids.is_empty());
  }

  #[test]
  fn test_legacy_target_object_form() {
    let compositor = EventCompositor::new();
    let payload = r#"{
      "configs": [
        {"eventSettingId": "roi-1", "eventType": "ROI",
         "points": [[0.1, 0.1], [0.9, 0.1], [0.9, 0.9], [0.1, 0.9]],
         "target": {"label": "person"}}
      ]
    }"#;
    compositor.update_settings(payload).unwrap();

    let rule = compositor.get_setting("roi-1").unwrap();
    assert_eq!(rule.targets, vec!["person".to_string()]);
  }

  fn line_payload(direction: &str) -> String {
    format!(
      r#"{{
        "configs": [
          {{
            "eventSettingId": "line-1",
            "eventType": "Line",
            "points": [[0.0, 0.5], [1.0, 0.5]],
            "targets": ["person"],
            "direction": "{}",
            "keypoints": [1],
            "warningDistance": 0.05
          }}
        ]
      }}"#,
      direction
    )
  }

  fn pose_detection(kp1: Keypoint) -> Detection {
    let mut det = detection("person", BoundingBox { x: 10, y: 10, width: 50, height: 50 });
    det.keypoints = vec![
      Keypoint { x: 0.1, y: 0.1, visible: 0.9 },
      kp1,
      Keypoint { x: 0.2, y: 0.2, visible: 0.9 },
    ];
    det
  }

  #[test]
  fn test_line_danger_via_keypoint() {
    let compositor = EventCompositor::new();
    compositor.update_settings(&line_payload("A2B")).unwrap();

    // 关键点 1 在线下方（正侧）→ DANGER
    let mut dets = vec![pose_detection(Keypoint { x: 0.5, y: 0.6, visible: 0.9 })];
    let events = compositor.check_frame(&mut dets, 640, 480);

    let status = &events["line-1"];
    assert_eq!(status.status, 2);
    assert_eq!(status.labels, vec!["person".to_string()]);
  }

  #[test]
  fn test_line_warning_within_distance() {
    let compositor = EventCompositor::new();
    compositor.update_settings(&line_payload("A2B")).unwrap();

    // 安全侧但距离 0.02 < 0.05 → WARNING
    let mut dets = vec![pose_detection(Keypoint { x: 0.5, y: 0.48, visible: 0.9 })];
    let events = compositor.check_frame(&mut dets, 640, 480);
    assert_eq!(events["line-1"].status, 1);
  }

  #[test]
  fn test_line_both_direction_never_danger() {
    let compositor = EventCompositor::new();
    compositor.update_settings(&line_payload("BOTH")).unwrap();

    let mut dets = vec![pose_detection(Keypoint { x: 0.5, y: 0.9, visible: 0.9 })];
    let events = compositor.check_frame(&mut dets, 640, 480);
    assert_eq!(events["line-1"].status, 0);

    let mut dets = vec![pose_detection(Keypoint { x: 0.5, y: 0.51, visible: 0.9 })];
    let events = compositor.check_frame(&mut dets, 640, 480);
    assert_eq!(events["line-1"].status, 1);
  }

  #[test]
  fn test_line_safe_without_keypoints() {
    let compositor = EventCompositor::new();
    compositor.update_settings(&line_payload("A2B")).unwrap();

    // 线规则由关键点驱动：无关键点时保持 SAFE
    let mut dets = vec![detection("person", BoundingBox { x: 10, y: 300, width: 50, height: 50 })];
    let events = compositor.check_frame(&mut dets, 640, 480);
    assert_eq!(events["line-1"].status, 0);
  }

  #[test]
  fn test_line_skips_low_visibility_keypoints() {
    let compositor = EventCompositor::new();
    compositor.update_settings(&line_payload("A2B")).unwrap();

    let mut dets = vec![pose_detection(Keypoint { x: 0.5, y: 0.6, visible: 0.1 })];
    let events = compositor.check_frame(&mut dets, 640, 480);
    assert_eq!(events["line-1"].status, 0);
  }

  #[test]
  fn test_angle_violation() {
    let compositor = EventCompositor::new();
    let payload = r#"{
      "configs": [
        {"eventSettingId": "angle-1", "eventType": "AngleViolation",
         "points": [[0.0, 0.0], [1.0, 0.0]],
         "targets": ["vehicle"],
         "angleThreshold": 45.0}
      ]
    }"#;
    compositor.update_settings(payload).unwrap();

    // 关键点 1→2 垂直于基准线: 夹角 90° > 45° → DANGER
    let mut det = detection("vehicle", BoundingBox { x: 10, y: 10, width: 50, height: 50 });
    det.keypoints = vec![
      Keypoint { x: 0.1, y: 0.1, visible: 0.9 },
      Keypoint { x: 0.5, y: 0.5, visible: 0.9 },
      Keypoint { x: 0.5, y: 0.3, visible: 0.9 },
    ];
    let mut dets = vec![det];
    let events = compositor.check_frame(&mut dets, 640, 480);
    assert_eq!(events["angle-1"].status, 2);

    // 平行于基准线: 夹角 0° → SAFE
    let mut det = detection("vehicle", BoundingBox { x: 10, y: 10, width: 50, height: 50 });
    det.keypoints = vec![
      Keypoint { x: 0.1, y: 0.1, visible: 0.9 },
      Keypoint { x: 0.3, y: 0.5, visible: 0.9 },
      Keypoint { x: 0.6, y: 0.5, visible: 0.9 },
    ];
    let mut dets = vec![det];
    let events = compositor.check_frame(&mut dets, 640, 480);
    assert_eq!(events["angle-1"].status, 0);
  }

  #[test]
  fn test_complex_rules_pass_through_safe() {
    let compositor = EventCompositor::new();
    let payload = r#"{
      "configs": [
        {"eventSettingId": "and-1", "eventType": "And"},
        {"eventSettingId": "speed-1", "eventType": "Speed"}
      ]
    }"#;
    compositor.update_settings(payload).unwrap();

    let mut dets = vec![detection("person", BoundingBox { x: 0, y: 0, width: 10, height: 10 })];
    let events = compositor.check_frame(&mut dets, 640, 480);
    assert_eq!(events["and-1"].status, 0);
    assert_eq!(events["speed-1"].status, 0);
  }

  #[test]
  fn test_terminal_computation() {
    let compositor = EventCompositor::new();
    let payload = r#"{
      "configs": [
        {"eventSettingId": "filter-1", "eventType": "Filter"},
        {"eventSettingId": "roi-1", "eventType": "ROI", "parentId": "filter-1",
         "points": [[0.1, 0.1], [0.9, 0.1], [0.9, 0.9], [0.1, 0.9]]},
        {"eventSettingId": "hm-1", "eventType": "HM"}
      ]
    }"#;
    let terminals = compositor.update_settings(payload).unwrap();

    // filter-1 有子节点不是叶子；hm-1 是叶子但类型被排除
    assert_eq!(terminals, vec!["roi-1".to_string()]);
  }

  #[test]
  fn test_update_is_idempotent() {
    let compositor = EventCompositor::new();
    let payload = roi_payload(r#"["person"]"#);

    let first = compositor.update_settings(&payload).unwrap();
    let count_first = compositor.setting_count();
    let second = compositor.update_settings(&payload).unwrap();

    assert_eq!(first, second);
    assert_eq!(count_first, compositor.setting_count());
  }

  #[test]
  fn test_clear_settings() {
    let compositor = EventCompositor::new();
    compositor.update_settings(&roi_payload(r#"["person"]"#)).unwrap();
    assert_eq!(compositor.setting_count(), 1);

    compositor.clear_settings();
    assert_eq!(compositor.setting_count(), 0);
    assert!(compositor.terminal_ids().is_empty());
  }

  #[test]
  fn test_missing_configs_rejected() {
    let compositor = EventCompositor::new();
    let result = compositor.update_settings(r#"{"version": "1.0.0"}"#);
    assert!(result.is_err());
  }

  #[test]
  fn test_rule_without_id_ignored() {
    let compositor = EventCompositor::new();
    let payload = r#"{
      "configs": [
        {"eventType": "ROI", "points": [[0.1, 0.1], [0.9, 0.1], [0.9, 0.9]]},
        {"eventSettingId": "roi-1", "eventType": "ROI",
         "points": [[0.1, 0.1], [0.9, 0.1], [0.9, 0.9]]}
      ]
    }"#;
    compositor.update_settings(payload).unwrap();
    assert_eq!(compositor.setting_count(), 1);
  }
}
