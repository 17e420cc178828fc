// 该文件是 Tianmu （天目） 项目的一部分。
// src/args.rs - 命令行参数
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use clap::Parser;

/// Tianmu 多路视频流 NPU 推理守护进程
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 配置文件路径
  #[arg(short = 'c', long, default_value = "config.yaml", value_name = "FILE")]
  pub config: String,

  /// 输出默认配置到标准输出后退出
  #[arg(short = 'g', long)]
  pub generate_config: bool,

  /// 覆盖 NATS 服务器地址
  #[arg(short = 'n', long, value_name = "URL")]
  pub nats_url: Option<String>,

  /// 覆盖模型存储目录
  #[arg(long, value_name = "DIR")]
  pub models_dir: Option<String>,

  /// 覆盖日志级别 (trace/debug/info/warn/error)
  #[arg(long, value_name = "LEVEL")]
  pub log_level: Option<String>,
}
