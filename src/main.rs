// 该文件是 Tianmu （天目） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tianmu::args::Args;
use tianmu::config::DaemonConfig;
use tianmu::control::ControlServer;
use tianmu::manager::StreamManager;
use tianmu::npu::NpuEngine;
use tianmu::publisher::NatsPublisher;
use tianmu::registry::ModelRegistry;

fn main() -> Result<()> {
  let args = Args::parse();

  if args.generate_config {
    print!("{}", DaemonConfig::default().to_yaml_string());
    return Ok(());
  }

  // 加载配置：文件缺失时退回默认并提示
  let mut config = if Path::new(&args.config).exists() {
    DaemonConfig::load_from_file(&args.config)
      .with_context(|| format!("加载配置文件 {} 失败", args.config))?
  } else {
    eprintln!("配置文件 {} 不存在，使用默认配置（--generate-config 可生成模板）", args.config);
    DaemonConfig::default()
  };

  // 命令行覆盖
  if let Some(url) = args.nats_url {
    config.nats.url = url;
  }
  if let Some(dir) = args.models_dir {
    config.models.models_dir = dir;
  }
  if let Some(level) = args.log_level {
    config.log.level = level;
  }
  config.validate().context("配置校验失败")?;

  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  info!("Tianmu 视频流推理守护进程");
  info!("NATS 地址: {}", config.nats.url);
  info!("模型目录: {}", config.models.models_dir);
  info!("最大流数量: {}", config.performance.max_streams);

  // 模型注册表
  let registry = Arc::new(ModelRegistry::new(&config.models.models_dir));
  registry.initialize().context("模型注册表初始化失败")?;
  info!("已注册模型: {}", registry.model_count());

  // 推理引擎与消息总线
  let engine = NpuEngine::new();
  let publisher = NatsPublisher::new(
    &config.nats.url,
    config.nats.reconnect_interval_seconds,
    config.nats.max_reconnect_attempts,
  );

  // 流注册表
  let manager = StreamManager::create(
    Arc::clone(&publisher),
    Arc::clone(&engine),
    config.performance.max_streams,
    config.worker_options(),
  );

  // 全局回调接到日志
  manager.set_global_detection_callback(Arc::new(|event| {
    debug!("流 {} 检测到 {} 个对象", event.stream_id, event.detections.len());
  }));
  manager.set_global_state_change_callback(Arc::new(|stream_id, state| {
    info!("流 {} 状态变更为 {}", stream_id, state);
  }));
  manager.set_global_error_callback(Arc::new(|stream_id, message| {
    error!("流 {} 错误: {}", stream_id, message);
  }));

  // 控制面
  let control = ControlServer::new(
    Arc::clone(&manager),
    Arc::clone(&registry),
    &config.nats.url,
    config.stream_config(),
  );

  manager.start();
  control.start();
  info!("守护进程已启动，Ctrl+C 退出");

  // 优雅退出：收到信号后按逆序停机，30 秒未完成则强制退出
  let shutdown = Arc::new(AtomicBool::new(false));
  let shutdown_flag = Arc::clone(&shutdown);
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    shutdown_flag.store(true, Ordering::SeqCst);
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("停机超时，强制退出");
      std::process::exit(1);
    });
  })
  .context("安装信号处理器失败")?;

  while !shutdown.load(Ordering::SeqCst) {
    thread::sleep(Duration::from_millis(100));
  }

  info!("停机中...");
  control.stop();
  manager.stop();
  engine.shutdown();
  info!("守护进程已退出");

  Ok(())
}
