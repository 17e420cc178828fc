// 该文件是 Tianmu （天目） 项目的一部分。
// src/npu/device.rs - NPU 设备抽象
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use super::NpuError;

/// NMS 输出的元数据（由已编译模型声明）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmsShape {
  pub num_classes: usize,
  pub max_bboxes_per_class: usize,
}

/// 单个输出张量描述
#[derive(Debug, Clone)]
pub struct OutputInfo {
  /// 张量名称标签；多尺度输出靠名称识别角色
  pub name: String,
  /// 单帧输出的 f32 数量
  pub len: usize,
  /// NMS 格式输出的形状元数据
  pub nms: Option<NmsShape>,
}

/// 已配置网络的设备侧抽象
///
/// 把加速器驱动隔离在这一层之后：写入一帧 RGB 输入、读取全部输出。
/// 批量模型遵循事务约定：恰好 `batch_size` 次写入之后跟随
/// `batch_size` 次读取。写读均为阻塞操作，驱动层超时 30 秒。
pub trait NpuNetwork: Send {
  fn input_width(&self) -> i32;
  fn input_height(&self) -> i32;
  fn batch_size(&self) -> usize;
  fn outputs(&self) -> &[OutputInfo];

  /// 写入一帧模型输入（`input_width * input_height * 3` 字节 RGB）
  fn write_input(&mut self, frame: &[u8]) -> Result<(), NpuError>;

  /// 读取一帧的全部输出到预分配缓冲区
  ///
  /// 必须每帧读取所有输出流，即使调用方只消费其中一部分；
  /// 未读取的输出会在设备侧积压并导致超时。
  fn read_outputs(&mut self, buffers: &mut [Vec<f32>]) -> Result<(), NpuError>;
}

/// 打开模型文件并配置网络
#[cfg(feature = "rknpu")]
pub fn open_network(path: &str) -> Result<Box<dyn NpuNetwork>, NpuError> {
  Ok(Box::new(rknn::RknnNetwork::open(path)?))
}

/// 打开模型文件并配置网络
///
/// 未启用 NPU 后端特性时始终失败；纯视频流不受影响。
#[cfg(not(feature = "rknpu"))]
pub fn open_network(path: &str) -> Result<Box<dyn NpuNetwork>, NpuError> {
  tracing::error!("无法加载模型 {}: 编译时未启用 rknpu 特性", path);
  Err(NpuError::BackendUnavailable)
}

#[cfg(feature = "rknpu")]
mod rknn {
  use rknpu::{RknnContext, RknnInput, TensorFormat, TensorType};
  use tracing::{debug, info};

  use super::{NpuNetwork, OutputInfo};
  use crate::npu::NpuError;

  /// RKNN 后端：一个已加载模型对应一个推理上下文
  pub struct RknnNetwork {
    context: RknnContext,
    input_width: i32,
    input_height: i32,
    outputs: Vec<OutputInfo>,
    /// 最近一次 run 的输出，等待 read_outputs 取走
    pending: Vec<Vec<f32>>,
  }

  impl RknnNetwork {
    pub fn open(path: &str) -> Result<Self, NpuError> {
      info!("加载 RKNN 模型: {}", path);
      let context = RknnContext::from_model_path(path)
        .map_err(|e| NpuError::ModelLoad(format!("无法加载模型 {}: {}", path, e)))?;

      let input_attr = &context.input_attrs[0];
      let input_height = input_attr.dims[1] as i32;
      let input_width = input_attr.dims[2] as i32;
      debug!("模型输入: {}x{}", input_width, input_height);

      let mut network = Self {
        context,
        input_width,
        input_height,
        outputs: Vec::new(),
        pending: Vec::new(),
      };

      // RKNN 接口不在加载期暴露输出形状，用一帧灰色图探测
      let probe = vec![114u8; (input_width * input_height * 3) as usize];
      network.run_frame(&probe)?;
      network.outputs = network
        .pending
        .iter()
        .enumerate()
        .map(|(i, buf)| OutputInfo {
          name: format!("output{}", i),
          len: buf.len(),
          nms: None,
        })
        .collect();
      network.pending.clear();

      info!("模型输出流数量: {}", network.outputs.len());
      Ok(network)
    }

    fn run_frame(&mut self, frame: &[u8]) -> Result<(), NpuError> {
      let input = RknnInput {
        index: 0,
        buf: frame.to_vec(),
        size: frame.len() as u32,
        pass_through: false,
        dtype: TensorType::Uint8,
        fmt: TensorFormat::NHWC,
      };

      let outputs = self
        .context
        .run(&[input])
        .map_err(|e| NpuError::Device(format!("推理执行失败: {}", e)))?;

      self.pending = outputs.into_iter().map(|o| o.buf).collect();
      Ok(())
    }
  }

  impl NpuNetwork for RknnNetwork {
    fn input_width(&self) -> i32 {
      self.input_width
    }

    fn input_height(&self) -> i32 {
      self.input_height
    }

    fn batch_size(&self) -> usize {
      1
    }

    fn outputs(&self) -> &[OutputInfo] {
      &self.outputs
    }

    fn write_input(&mut self, frame: &[u8]) -> Result<(), NpuError> {
      self.run_frame(frame)
    }

    fn read_outputs(&mut self, buffers: &mut [Vec<f32>]) -> Result<(), NpuError> {
      if self.pending.len() != buffers.len() {
        return Err(NpuError::Device(format!(
          "输出流数量不一致: 预期 {} 实际 {}",
          buffers.len(),
          self.pending.len()
        )));
      }

      for (dst, src) in buffers.iter_mut().zip(self.pending.drain(..)) {
        if dst.len() != src.len() {
          return Err(NpuError::OutputSizeMismatch { expected: dst.len(), actual: src.len() });
        }
        dst.copy_from_slice(&src);
      }
      Ok(())
    }
  }
}
