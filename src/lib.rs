// sshmux - SSH 连接复用层
//
// ssh: 连接注册表、连接建立与通道复用
// services: 终端输出转发、状态采集、文件浏览
// models: 可序列化的数据结构

pub mod models;
pub mod services;
pub mod ssh;
