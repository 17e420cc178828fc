// 该文件是 Tianmu （天目） 项目的一部分。
// src/batch.rs - 批量推理调度器
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 批量推理调度器
//!
//! batch_size > 1 的模型按需创建一个调度器，把多路流的帧
//! 汇聚成一次设备调用。第一帧入队后在 `batch_timeout_ms` 内
//! 等待凑满批次，超时则用灰色帧补齐发车。
//!
//! 同一条流由其工作线程串行提交，调度器不会重排单流的帧序；
//! 跨流之间没有顺序保证。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::npu::{BatchFrameInput, NpuModel};
use crate::types::Detection;

/// 默认批次收集超时（毫秒）
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 50;

/// 结果回执：一帧的检测结果交还给提交方
pub type ResultSink = Box<dyn FnOnce(Vec<Detection>) + Send>;

struct PendingFrame {
  stream_id: String,
  rgb: Vec<u8>,
  width: i32,
  height: i32,
  submit_time: Instant,
  sink: ResultSink,
}

struct SchedulerInner {
  model: Arc<NpuModel>,
  batch_timeout: Duration,
  confidence_threshold: f32,
  queue: Mutex<VecDeque<PendingFrame>>,
  available: Condvar,
  running: AtomicBool,
}

/// 每个批量模型一个调度器实例，流工作线程共享
pub struct BatchScheduler {
  inner: Arc<SchedulerInner>,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchScheduler {
  /// 创建并启动工作线程
  pub fn start(
    model: Arc<NpuModel>,
    batch_timeout_ms: u64,
    confidence_threshold: f32,
  ) -> Arc<Self> {
    let inner = Arc::new(SchedulerInner {
      model,
      batch_timeout: Duration::from_millis(batch_timeout_ms),
      confidence_threshold,
      queue: Mutex::new(VecDeque::new()),
      available: Condvar::new(),
      running: AtomicBool::new(true),
    });

    let worker_inner = Arc::clone(&inner);
    let handle = thread::Builder::new()
      .name("batch-scheduler".to_string())
      .spawn(move || worker_loop(worker_inner))
      .ok();

    if handle.is_none() {
      warn!("批量调度器工作线程启动失败");
    }

    Arc::new(Self { inner, worker: Mutex::new(handle) })
  }

  /// 提交一帧（复制提交，调用方缓冲区可立即复用）
  pub fn submit(&self, stream_id: &str, rgb: &[u8], width: i32, height: i32, sink: ResultSink) {
    if !self.inner.running.load(Ordering::SeqCst) {
      warn!("批量调度器已停止，丢弃来自 {} 的帧", stream_id);
      sink(Vec::new());
      return;
    }

    let frame = PendingFrame {
      stream_id: stream_id.to_string(),
      rgb: rgb.to_vec(),
      width,
      height,
      submit_time: Instant::now(),
      sink,
    };

    {
      let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
      queue.push_back(frame);
    }
    self.inner.available.notify_one();
  }

  /// 停止调度器：队列剩余帧组成最终批次处理完后线程退出
  pub fn stop(&self) {
    if !self.inner.running.swap(false, Ordering::SeqCst) {
      return;
    }
    self.inner.available.notify_all();

    let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(h) = handle {
      let _ = h.join();
    }
    info!("批量调度器已停止");
  }

  pub fn queue_len(&self) -> usize {
    self.inner.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
  }
}

fn worker_loop(inner: Arc<SchedulerInner>) {
  let batch_size = inner.model.batch_size();
  debug!("批量调度器工作线程启动, batch={}", batch_size);

  loop {
    let mut batch = Vec::with_capacity(batch_size);

    {
      let mut queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());

      // 等第一帧或停止信号
      while queue.is_empty() && inner.running.load(Ordering::SeqCst) {
        queue = inner
          .available
          .wait(queue)
          .unwrap_or_else(|e| e.into_inner());
      }

      if queue.is_empty() {
        // 停止且无剩余
        break;
      }

      let first = match queue.pop_front() {
        Some(f) => f,
        None => break,
      };
      let deadline = first.submit_time + inner.batch_timeout;
      batch.push(first);

      // 截止时间内继续凑批
      while batch.len() < batch_size {
        if let Some(frame) = queue.pop_front() {
          batch.push(frame);
          continue;
        }
        if !inner.running.load(Ordering::SeqCst) {
          break;
        }

        let now = Instant::now();
        if now >= deadline {
          break;
        }
        let (q, _timeout) = inner
          .available
          .wait_timeout(queue, deadline - now)
          .unwrap_or_else(|e| e.into_inner());
        queue = q;
      }
    }

    process_batch(&inner, batch);

    if !inner.running.load(Ordering::SeqCst) {
      // 停止前清空剩余队列
      loop {
        let mut drained = Vec::with_capacity(batch_size);
        {
          let mut queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
          while drained.len() < batch_size {
            match queue.pop_front() {
              Some(f) => drained.push(f),
              None => break,
            }
          }
        }
        if drained.is_empty() {
          break;
        }
        process_batch(&inner, drained);
      }
      break;
    }
  }

  debug!("批量调度器工作线程退出");
}

fn process_batch(inner: &SchedulerInner, batch: Vec<PendingFrame>) {
  if batch.is_empty() {
    return;
  }

  let mut inputs = Vec::with_capacity(batch.len());
  let mut sinks = Vec::with_capacity(batch.len());
  for frame in batch {
    inputs.push(BatchFrameInput {
      stream_id: frame.stream_id,
      rgb: frame.rgb,
      width: frame.width,
      height: frame.height,
    });
    sinks.push(frame.sink);
  }

  let mut results = inner.model.run_batch(&inputs, inner.confidence_threshold);

  for (input, sink) in inputs.into_iter().zip(sinks) {
    // 缺失结果的流回执空检测
    let detections = results.remove(&input.stream_id).unwrap_or_default();
    sink(detections);
  }
}
