// 该文件是 Tianmu （天目） 项目的一部分。
// src/npu/postprocess.rs - 模型输出解析
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 模型输出解析
//!
//! 两种输出格式：
//! - NMS 格式：设备侧已做后处理，按类别排布的检测槽位；
//! - 原始多尺度格式：三个金字塔层（stride 8/16/32）各带
//!   DFL、类别、关键点三路输出，主机侧解码 + NMS。

use tracing::{debug, warn};

use super::device::OutputInfo;
use super::{ModelDescriptor, ModelRuntime};
use crate::geometry::{decode_dfl, nms_indices, sigmoid, LetterboxInfo, DFL_REG_MAX};
use crate::types::{BoundingBox, Detection, Keypoint};

/// 金字塔层的 stride
const RAW_STRIDES: [i32; 3] = [8, 16, 32];

/// 输出张量名称 → 角色映射
///
/// 名称而非字节大小作为识别依据：当类别数接近关键点通道数
/// （C ≈ 3K）时，不同角色的输出会出现大小碰撞。
/// conv43/44/45 = P3（DFL/类别/关键点），conv57/58/59 = P4，
/// conv70/71/72 = P5。
const RAW_NAME_ROLES: [[&str; 3]; 3] = [
  ["conv43", "conv44", "conv45"],
  ["conv57", "conv58", "conv59"],
  ["conv70", "conv71", "conv72"],
];

/// 一个金字塔层解析所需的输出索引
#[derive(Debug, Clone, Copy)]
struct ScalePlan {
  grid_w: i32,
  grid_h: i32,
  stride: i32,
  dfl_idx: usize,
  class_idx: usize,
  kp_idx: Option<usize>,
}

/// 解析 NMS 格式输出
///
/// 布局：每个类别 `max_bboxes_per_class` 个槽位，每槽
/// `[y_min, x_min, y_max, x_max, score, (kp_x, kp_y, kp_conf)*K]`，
/// 坐标归一化到模型输入。
pub fn parse_nms_output(
  data: &[f32],
  desc: &ModelDescriptor,
  runtime: &ModelRuntime,
  confidence_threshold: f32,
  frame_width: i32,
  frame_height: i32,
  letterbox: &LetterboxInfo,
) -> Vec<Detection> {
  let mut detections = Vec::new();

  let total_slots = desc.num_classes * desc.max_bboxes_per_class;
  if total_slots == 0 {
    return detections;
  }

  // 槽位参数个数从输出实际大小推导；模型可能省略关键点块
  let actual_params = data.len() / total_slots;
  let keypoint_params = if runtime.task == "pose" { runtime.num_keypoints * 3 } else { 0 };
  let expected_params = 5 + keypoint_params;
  let det_params = if actual_params > 0 && actual_params != expected_params {
    debug!("NMS 槽位参数按输出大小修正: {} -> {}", expected_params, actual_params);
    actual_params
  } else {
    expected_params
  };

  if det_params < 5 {
    return detections;
  }

  let has_keypoints = keypoint_params > 0 && det_params >= 5 + keypoint_params;

  for cls in 0..desc.num_classes {
    for slot in 0..desc.max_bboxes_per_class {
      let offset = (cls * desc.max_bboxes_per_class + slot) * det_params;
      if offset + 5 > data.len() {
        break;
      }

      let y_min = data[offset];
      let x_min = data[offset + 1];
      let y_max = data[offset + 2];
      let x_max = data[offset + 3];
      let score = data[offset + 4];

      if score < confidence_threshold {
        continue;
      }

      // 归一化坐标 → 模型像素 → 逆 letterbox → 原始帧像素
      let (x1, y1) = letterbox.to_original(x_min * desc.input_width as f32, y_min * desc.input_height as f32);
      let (x2, y2) = letterbox.to_original(x_max * desc.input_width as f32, y_max * desc.input_height as f32);

      let mut det = Detection {
        class_id: cls as u16,
        class_name: class_name_for(runtime, cls),
        confidence: score,
        bbox: clamp_bbox(x1, y1, x2, y2, frame_width, frame_height),
        ..Default::default()
      };

      if has_keypoints {
        for k in 0..runtime.num_keypoints {
          let kp_offset = offset + 5 + k * 3;
          if kp_offset + 3 > data.len() {
            break;
          }
          det.keypoints.push(project_keypoint(
            data[kp_offset] * desc.input_width as f32,
            data[kp_offset + 1] * desc.input_height as f32,
            data[kp_offset + 2],
            frame_width,
            frame_height,
            letterbox,
          ));
        }
      }

      if det.bbox.width > 0 && det.bbox.height > 0 {
        detections.push(det);
      }
    }
  }

  detections
}

/// 解析原始多尺度输出并做类内 NMS
pub fn parse_raw_yolo(
  buffers: &[Vec<f32>],
  infos: &[OutputInfo],
  desc: &ModelDescriptor,
  runtime: &ModelRuntime,
  confidence_threshold: f32,
  iou_threshold: f32,
  frame_width: i32,
  frame_height: i32,
  letterbox: &LetterboxInfo,
) -> Vec<Detection> {
  let num_classes = if runtime.labels.is_empty() { desc.num_classes } else { runtime.labels.len() };
  let num_keypoints = runtime.num_keypoints;

  let scales = map_scales(infos, desc, num_classes, num_keypoints);
  if scales.is_empty() {
    warn!("输出中没有可识别的检测尺度");
    return Vec::new();
  }

  let mut all_boxes: Vec<[f32; 4]> = Vec::new();
  let mut all_scores: Vec<f32> = Vec::new();
  let mut all_classes: Vec<u16> = Vec::new();
  let mut all_keypoints: Vec<Vec<[f32; 3]>> = Vec::new();

  for scale in &scales {
    let dfl = &buffers[scale.dfl_idx];
    let class_data = &buffers[scale.class_idx];
    let kp_data = scale.kp_idx.map(|i| &buffers[i]);
    let stride = scale.stride as f32;

    for gy in 0..scale.grid_h {
      for gx in 0..scale.grid_w {
        let pixel_idx = (gy * scale.grid_w + gx) as usize;
        let class_base = pixel_idx * num_classes;

        // 最优类别；越界的 logit 过 sigmoid 归一
        let mut best_class = 0usize;
        let mut best_raw = f32::MIN;
        for c in 0..num_classes {
          let v = class_data[class_base + c];
          if v > best_raw {
            best_raw = v;
            best_class = c;
          }
        }
        let score = if (0.0..=1.0).contains(&best_raw) { best_raw } else { sigmoid(best_raw) };
        if score < confidence_threshold {
          continue;
        }

        // DFL 四边距解码，通道布局 [L0..15, T0..15, R0..15, B0..15]
        let dfl_base = pixel_idx * 4 * DFL_REG_MAX;
        let dist_left = decode_dfl(&dfl[dfl_base..dfl_base + DFL_REG_MAX]);
        let dist_top = decode_dfl(&dfl[dfl_base + DFL_REG_MAX..dfl_base + 2 * DFL_REG_MAX]);
        let dist_right = decode_dfl(&dfl[dfl_base + 2 * DFL_REG_MAX..dfl_base + 3 * DFL_REG_MAX]);
        let dist_bottom = decode_dfl(&dfl[dfl_base + 3 * DFL_REG_MAX..dfl_base + 4 * DFL_REG_MAX]);

        let anchor_x = (gx as f32 + 0.5) * stride;
        let anchor_y = (gy as f32 + 0.5) * stride;

        let x1 = anchor_x - dist_left * stride;
        let y1 = anchor_y - dist_top * stride;
        let x2 = anchor_x + dist_right * stride;
        let y2 = anchor_y + dist_bottom * stride;

        if x2 <= 0.0 || y2 <= 0.0 || x1 >= desc.input_width as f32 || y1 >= desc.input_height as f32 {
          continue;
        }
        if x2 - x1 <= 0.0 || y2 - y1 <= 0.0 {
          continue;
        }

        let mut kpts = Vec::new();
        if let Some(kp) = kp_data {
          let kp_base = pixel_idx * num_keypoints * 3;
          for k in 0..num_keypoints {
            let raw_x = kp[kp_base + k * 3];
            let raw_y = kp[kp_base + k * 3 + 1];
            let mut vis = kp[kp_base + k * 3 + 2];
            if !(0.0..=1.0).contains(&vis) {
              vis = sigmoid(vis);
            }

            // 关键点解码: kp = (grid + 2 * raw) * stride
            let kp_x = (gx as f32 + raw_x * 2.0) * stride;
            let kp_y = (gy as f32 + raw_y * 2.0) * stride;
            kpts.push([kp_x, kp_y, vis]);
          }
        }

        all_boxes.push([x1, y1, x2, y2]);
        all_scores.push(score);
        all_classes.push(best_class as u16);
        all_keypoints.push(kpts);
      }
    }
  }

  debug!("NMS 前候选数: {}", all_boxes.len());

  let keep = nms_indices(&all_boxes, &all_scores, &all_classes, iou_threshold);

  let mut detections = Vec::with_capacity(keep.len());
  for idx in keep {
    let b = &all_boxes[idx];
    let (x1, y1) = letterbox.to_original(b[0], b[1]);
    let (x2, y2) = letterbox.to_original(b[2], b[3]);

    let mut det = Detection {
      class_id: all_classes[idx],
      class_name: class_name_for(runtime, all_classes[idx] as usize),
      confidence: all_scores[idx],
      bbox: clamp_bbox(x1, y1, x2, y2, frame_width, frame_height),
      ..Default::default()
    };

    for kp in &all_keypoints[idx] {
      det.keypoints.push(project_keypoint(kp[0], kp[1], kp[2], frame_width, frame_height, letterbox));
    }

    if det.bbox.width > 0 && det.bbox.height > 0 {
      detections.push(det);
    }
  }

  detections
}

/// 按名称识别各输出的角色，未命名输出回退到按大小匹配
fn map_scales(
  infos: &[OutputInfo],
  desc: &ModelDescriptor,
  num_classes: usize,
  num_keypoints: usize,
) -> Vec<ScalePlan> {
  let mut scales = Vec::new();

  for (level, stride) in RAW_STRIDES.iter().enumerate() {
    let grid_w = desc.input_width / stride;
    let grid_h = desc.input_height / stride;
    let spatial = (grid_w * grid_h) as usize;

    let by_name = |tag: &str| infos.iter().position(|o| !tag.is_empty() && o.name.contains(tag));
    let by_len = |len: usize, taken: &[Option<usize>]| {
      infos
        .iter()
        .enumerate()
        .find(|(i, o)| o.len == len && !taken.contains(&Some(*i)))
        .map(|(i, _)| i)
    };

    let mut dfl_idx = by_name(RAW_NAME_ROLES[level][0]);
    let mut class_idx = by_name(RAW_NAME_ROLES[level][1]);
    let mut kp_idx = by_name(RAW_NAME_ROLES[level][2]);

    if dfl_idx.is_none() {
      dfl_idx = by_len(spatial * 4 * DFL_REG_MAX, &[class_idx, kp_idx]);
    }
    if class_idx.is_none() {
      class_idx = by_len(spatial * num_classes, &[dfl_idx, kp_idx]);
    }
    if kp_idx.is_none() && num_keypoints > 0 {
      kp_idx = by_len(spatial * num_keypoints * 3, &[dfl_idx, class_idx]);
    }

    if let (Some(dfl), Some(class)) = (dfl_idx, class_idx) {
      scales.push(ScalePlan { grid_w, grid_h, stride: *stride, dfl_idx: dfl, class_idx: class, kp_idx });
    }
  }

  scales
}

fn class_name_for(runtime: &ModelRuntime, class_id: usize) -> String {
  runtime
    .labels
    .get(class_id)
    .cloned()
    .unwrap_or_else(|| "object".to_string())
}

/// 四角裁剪到帧内后取整组装边界框
fn clamp_bbox(x1: f32, y1: f32, x2: f32, y2: f32, frame_w: i32, frame_h: i32) -> BoundingBox {
  let cx1 = x1.round().clamp(0.0, frame_w as f32);
  let cy1 = y1.round().clamp(0.0, frame_h as f32);
  let cx2 = x2.round().clamp(0.0, frame_w as f32);
  let cy2 = y2.round().clamp(0.0, frame_h as f32);

  BoundingBox {
    x: cx1 as i32,
    y: cy1 as i32,
    width: (cx2 - cx1) as i32,
    height: (cy2 - cy1) as i32,
  }
}

/// 模型像素坐标的关键点投影回原始帧并归一化
fn project_keypoint(
  model_x: f32,
  model_y: f32,
  visible: f32,
  frame_w: i32,
  frame_h: i32,
  letterbox: &LetterboxInfo,
) -> Keypoint {
  let (ox, oy) = letterbox.to_original(model_x, model_y);
  Keypoint {
    x: (ox / frame_w as f32).clamp(0.0, 1.0),
    y: (oy / frame_h as f32).clamp(0.0, 1.0),
    visible: visible.clamp(0.0, 1.0),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::npu::OutputKind;

  fn desc_nms(input: i32, num_classes: usize, max_bboxes: usize) -> ModelDescriptor {
    ModelDescriptor {
      input_width: input,
      input_height: input,
      batch_size: 1,
      output_kind: OutputKind::Nms,
      num_classes,
      max_bboxes_per_class: max_bboxes,
    }
  }

  fn runtime_det(labels: &[&str]) -> ModelRuntime {
    ModelRuntime {
      task: "det".to_string(),
      num_keypoints: 0,
      labels: labels.iter().map(|s| s.to_string()).collect(),
    }
  }

  #[test]
  fn test_nms_parse_basic() {
    let desc = desc_nms(640, 2, 2);
    let runtime = runtime_det(&["person", "car"]);

    // 槽位: [y_min, x_min, y_max, x_max, score]
    let mut data = vec![0.0f32; 2 * 2 * 5];
    data[0..5].copy_from_slice(&[0.25, 0.25, 0.75, 0.75, 0.9]);

    let lb = LetterboxInfo::identity(640, 640);
    let dets = parse_nms_output(&data, &desc, &runtime, 0.5, 640, 640, &lb);

    assert_eq!(dets.len(), 1);
    assert_eq!(dets[0].class_name, "person");
    assert_eq!(dets[0].bbox, BoundingBox { x: 160, y: 160, width: 320, height: 320 });
  }

  #[test]
  fn test_nms_parse_threshold_filters() {
    let desc = desc_nms(640, 1, 2);
    let runtime = runtime_det(&["person"]);

    let mut data = vec![0.0f32; 2 * 5];
    data[0..5].copy_from_slice(&[0.1, 0.1, 0.2, 0.2, 0.3]);
    data[5..10].copy_from_slice(&[0.1, 0.1, 0.2, 0.2, 0.7]);

    let lb = LetterboxInfo::identity(640, 640);
    let dets = parse_nms_output(&data, &desc, &runtime, 0.5, 640, 640, &lb);
    assert_eq!(dets.len(), 1);
    assert!((dets[0].confidence - 0.7).abs() < 1e-6);
  }

  #[test]
  fn test_nms_parse_unknown_class_label() {
    let desc = desc_nms(640, 2, 1);
    let runtime = runtime_det(&["person"]);

    let mut data = vec![0.0f32; 2 * 5];
    // 第二个类别没有配置标签
    data[5..10].copy_from_slice(&[0.1, 0.1, 0.5, 0.5, 0.8]);

    let lb = LetterboxInfo::identity(640, 640);
    let dets = parse_nms_output(&data, &desc, &runtime, 0.5, 640, 640, &lb);
    assert_eq!(dets.len(), 1);
    assert_eq!(dets[0].class_name, "object");
  }

  #[test]
  fn test_nms_parse_letterbox_projection() {
    // 1920x1080 → 640: scale=1/3, pad_y=(640-360)/2=140
    let desc = desc_nms(640, 1, 1);
    let runtime = runtime_det(&["person"]);

    let mut data = vec![0.0f32; 5];
    // 模型空间中心区域的框
    data[0..5].copy_from_slice(&[0.25, 0.25, 0.75, 0.75, 0.9]);

    let lb = LetterboxInfo { scale: 1.0 / 3.0, pad_x: 0, pad_y: 140, new_w: 640, new_h: 360 };
    let dets = parse_nms_output(&data, &desc, &runtime, 0.5, 1920, 1080, &lb);

    assert_eq!(dets.len(), 1);
    let b = dets[0].bbox;
    // x: 0.25*640=160 → 480; y: 0.25*640=160 → (160-140)*3=60
    assert_eq!(b.x, 480);
    assert_eq!(b.y, 60);
    assert_eq!(b.width, 960);
    assert_eq!(b.height, 960);
  }

  #[test]
  fn test_nms_parse_pose_keypoints() {
    let desc = desc_nms(640, 1, 1);
    let runtime = ModelRuntime {
      task: "pose".to_string(),
      num_keypoints: 2,
      labels: vec!["vehicle".to_string()],
    };

    // 槽位: 5 + 2*3 = 11 个参数
    let data = vec![0.1, 0.1, 0.9, 0.9, 0.8, 0.5, 0.5, 0.9, 0.25, 0.75, 0.6];

    let lb = LetterboxInfo::identity(640, 640);
    let dets = parse_nms_output(&data, &desc, &runtime, 0.5, 640, 640, &lb);

    assert_eq!(dets.len(), 1);
    assert_eq!(dets[0].keypoints.len(), 2);
    let kp = dets[0].keypoints[0];
    assert!((kp.x - 0.5).abs() < 1e-5);
    assert!((kp.y - 0.5).abs() < 1e-5);
    assert!((kp.visible - 0.9).abs() < 1e-5);
  }

  #[test]
  fn test_nms_parse_keypoints_omitted_by_model() {
    // 模型声明 pose 但输出槽位只有 5 个参数：按实际大小解析，不读关键点
    let desc = desc_nms(640, 1, 2);
    let runtime = ModelRuntime {
      task: "pose".to_string(),
      num_keypoints: 4,
      labels: vec!["vehicle".to_string()],
    };

    let mut data = vec![0.0f32; 2 * 5];
    data[0..5].copy_from_slice(&[0.1, 0.1, 0.5, 0.5, 0.9]);

    let lb = LetterboxInfo::identity(640, 640);
    let dets = parse_nms_output(&data, &desc, &runtime, 0.5, 640, 640, &lb);
    assert_eq!(dets.len(), 1);
    assert!(dets[0].keypoints.is_empty());
  }

  // ---- 原始多尺度输出 ----

  fn raw_outputs(input: i32, num_classes: usize, num_keypoints: usize) -> (Vec<OutputInfo>, Vec<Vec<f32>>) {
    let mut infos = Vec::new();
    let mut buffers = Vec::new();
    for (level, stride) in RAW_STRIDES.iter().enumerate() {
      let spatial = ((input / stride) * (input / stride)) as usize;
      for (role, channels) in [(0usize, 64), (1, num_classes), (2, num_keypoints * 3)] {
        infos.push(OutputInfo {
          name: RAW_NAME_ROLES[level][role].to_string(),
          len: spatial * channels,
          nms: None,
        });
        buffers.push(vec![0.0f32; spatial * channels]);
      }
    }
    (infos, buffers)
  }

  fn desc_raw(input: i32, num_classes: usize) -> ModelDescriptor {
    ModelDescriptor {
      input_width: input,
      input_height: input,
      batch_size: 1,
      output_kind: OutputKind::RawYolo,
      num_classes,
      max_bboxes_per_class: 100,
    }
  }

  /// 在 P5 (stride 32) 的指定网格写入一个高置信度目标
  fn plant_cell(
    buffers: &mut [Vec<f32>],
    input: i32,
    num_classes: usize,
    num_keypoints: usize,
    gx: usize,
    gy: usize,
    class_id: usize,
    logit: f32,
  ) {
    let grid = (input / 32) as usize;
    let pixel = gy * grid + gx;
    // P5 的三个输出位于末尾
    let dfl = 6;
    let cls = 7;
    let kp = 8;

    buffers[cls][pixel * num_classes + class_id] = logit;

    // DFL: 每条边在 bin 4 放置峰值 → 距离约 4 格
    for edge in 0..4 {
      buffers[dfl][pixel * 64 + edge * 16 + 4] = 12.0;
    }

    if num_keypoints > 0 {
      for k in 0..num_keypoints {
        let base = pixel * num_keypoints * 3 + k * 3;
        buffers[kp][base] = 0.25; // (gx + 0.5) * stride
        buffers[kp][base + 1] = 0.25;
        buffers[kp][base + 2] = 3.0; // sigmoid 后 ≈ 0.95
      }
    }
  }

  #[test]
  fn test_raw_parse_single_cell() {
    let input = 960;
    let (infos, mut buffers) = raw_outputs(input, 13, 4);
    plant_cell(&mut buffers, input, 13, 4, 15, 15, 2, 8.0);

    let desc = desc_raw(input, 13);
    let runtime = ModelRuntime {
      task: "pose".to_string(),
      num_keypoints: 4,
      labels: (0..13).map(|i| format!("class{}", i)).collect(),
    };

    let lb = LetterboxInfo::identity(input, input);
    let dets = parse_raw_yolo(&buffers, &infos, &desc, &runtime, 0.5, 0.45, input, input, &lb);

    assert_eq!(dets.len(), 1);
    let det = &dets[0];
    assert_eq!(det.class_id, 2);
    assert_eq!(det.class_name, "class2");

    // anchor = (15.5*32, 15.5*32) = (496, 496), 每边 4 格 * 32 = 128
    assert_eq!(det.bbox.x, 368);
    assert_eq!(det.bbox.y, 368);
    assert_eq!(det.bbox.width, 256);
    assert_eq!(det.bbox.height, 256);

    // 关键点: (15 + 0.25*2)*32 = 496 → 归一化 496/960
    assert_eq!(det.keypoints.len(), 4);
    let kp = det.keypoints[0];
    assert!((kp.x - 496.0 / 960.0).abs() < 1e-4);
    assert!(kp.visible > 0.9);
  }

  #[test]
  fn test_raw_parse_low_confidence_skipped() {
    let input = 960;
    let (infos, mut buffers) = raw_outputs(input, 13, 4);
    // logit -3 → sigmoid ≈ 0.047
    plant_cell(&mut buffers, input, 13, 4, 10, 10, 0, -3.0);

    let desc = desc_raw(input, 13);
    let runtime = ModelRuntime {
      task: "pose".to_string(),
      num_keypoints: 4,
      labels: vec![],
    };

    let lb = LetterboxInfo::identity(input, input);
    let dets = parse_raw_yolo(&buffers, &infos, &desc, &runtime, 0.25, 0.45, input, input, &lb);
    assert!(dets.is_empty());
  }

  #[test]
  fn test_raw_parse_letterbox_round_trip() {
    // 1920x1080 源 → 960 模型输入: scale=0.5, pad_y=210
    let input = 960;
    let (infos, mut buffers) = raw_outputs(input, 13, 0);
    plant_cell(&mut buffers, input, 13, 0, 14, 14, 0, 8.0);

    let desc = desc_raw(input, 13);
    let runtime = runtime_det(&["target"]);

    let lb = LetterboxInfo { scale: 0.5, pad_x: 0, pad_y: 210, new_w: 960, new_h: 540 };
    let dets = parse_raw_yolo(&buffers, &infos, &desc, &runtime, 0.5, 0.45, 1920, 1080, &lb);

    assert_eq!(dets.len(), 1);
    // anchor = 14.5*32 = 464, 每边 128 → 模型坐标 (336,336)-(592,592)
    // 逆 letterbox: x = 336/0.5 = 672, y = (336-210)/0.5 = 252
    assert_eq!(dets[0].bbox.x, 672);
    assert_eq!(dets[0].bbox.y, 252);
    assert_eq!(dets[0].bbox.width, 512);
    assert_eq!(dets[0].bbox.height, 512);
  }

  #[test]
  fn test_raw_parse_nms_suppresses_duplicates() {
    let input = 960;
    let (infos, mut buffers) = raw_outputs(input, 13, 0);
    // 相邻两格几乎重叠的同类目标
    plant_cell(&mut buffers, input, 13, 0, 15, 15, 1, 8.0);
    plant_cell(&mut buffers, input, 13, 0, 16, 15, 1, 6.0);

    let desc = desc_raw(input, 13);
    let runtime = runtime_det(&[]);

    let lb = LetterboxInfo::identity(input, input);
    let dets = parse_raw_yolo(&buffers, &infos, &desc, &runtime, 0.5, 0.45, input, input, &lb);
    assert_eq!(dets.len(), 1);
    assert!((dets[0].confidence - sigmoid(8.0)).abs() < 1e-5);
  }

  #[test]
  fn test_raw_parse_size_fallback_without_names() {
    // 输出没有已知名称标签时按大小匹配角色
    let input = 960;
    let (mut infos, mut buffers) = raw_outputs(input, 13, 4);
    for info in infos.iter_mut() {
      info.name = String::new();
    }
    plant_cell(&mut buffers, input, 13, 4, 15, 15, 2, 8.0);

    let desc = desc_raw(input, 13);
    let runtime = ModelRuntime {
      task: "pose".to_string(),
      num_keypoints: 4,
      labels: vec![],
    };

    let lb = LetterboxInfo::identity(input, input);
    let dets = parse_raw_yolo(&buffers, &infos, &desc, &runtime, 0.5, 0.45, input, input, &lb);
    assert_eq!(dets.len(), 1);
  }

  #[test]
  fn test_bbox_always_inside_frame() {
    // 框越过帧边缘时裁剪，不产生越界坐标
    let desc = desc_nms(640, 1, 1);
    let runtime = runtime_det(&["person"]);

    let data = vec![-0.1f32, -0.1, 1.2, 1.2, 0.9];
    let lb = LetterboxInfo::identity(640, 640);
    let dets = parse_nms_output(&data, &desc, &runtime, 0.5, 640, 480, &lb);

    assert_eq!(dets.len(), 1);
    let b = dets[0].bbox;
    assert!(b.x >= 0 && b.y >= 0);
    assert!(b.x + b.width <= 640);
    assert!(b.y + b.height <= 480);
  }
}
