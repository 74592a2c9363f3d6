// 测试用 Connector / Transport

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{
    Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode,
};
use tokio::sync::mpsc;

use super::config::SshConfig;
use super::connection::{Connector, Transport};
use super::error::SshError;
use super::output_buffer::{self, EventSender, DEFAULT_MAX_BUFFERED_BYTES};
use super::session::{ChannelEvent, CommandOutput, PtyRequest, ShellCommand, TerminalChannel};

/// 远端一侧的 Shell 队列
struct ShellRemote {
    cmd_rx: mpsc::UnboundedReceiver<ShellCommand>,
    event_tx: EventSender,
    writable: Arc<AtomicBool>,
}

#[derive(Default)]
struct TransportInner {
    dead: AtomicBool,
    shells: Mutex<Vec<ShellRemote>>,
    responses: Mutex<HashMap<String, CommandOutput>>,
    execs: AtomicUsize,
    closes: AtomicUsize,
    files: Arc<Mutex<BTreeMap<String, MemoryNode>>>,
    sftp_refused: AtomicBool,
    sftp_opened: AtomicUsize,
    sftp_closed: Arc<AtomicUsize>,
}

#[derive(Clone, Default)]
pub struct MockTransport(Arc<TransportInner>);

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shells_opened(&self) -> usize {
        self.0.shells.lock().len()
    }

    /// 远端推送一个事件
    pub fn emit(&self, index: usize, event: ChannelEvent) {
        let shells = self.0.shells.lock();
        shells[index].event_tx.send(event);
    }

    /// 远端 Shell 退出
    pub fn kill_shell(&self, index: usize) {
        let shells = self.0.shells.lock();
        shells[index].writable.store(false, Ordering::Relaxed);
        shells[index]
            .event_tx
            .send(ChannelEvent::Exit("exit status 0".to_string()));
    }

    /// 取出远端目前收到的全部命令
    pub fn drain_commands(&self, index: usize) -> Vec<ShellCommand> {
        let mut shells = self.0.shells.lock();
        let mut commands = Vec::new();
        while let Ok(cmd) = shells[index].cmd_rx.try_recv() {
            commands.push(cmd);
        }
        commands
    }

    pub fn respond(&self, command: &str, stdout: &str, stderr: &str) {
        self.0.responses.lock().insert(
            command.to_string(),
            CommandOutput {
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
                exit_code: 0,
            },
        );
    }

    /// 命令以非零退出码结束
    pub fn fail(&self, command: &str, stderr: &str) {
        self.0.responses.lock().insert(
            command.to_string(),
            CommandOutput {
                stdout: Vec::new(),
                stderr: stderr.as_bytes().to_vec(),
                exit_code: 1,
            },
        );
    }

    pub fn execs_run(&self) -> usize {
        self.0.execs.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }

    /// 模拟远端断开
    pub fn drop_link(&self) {
        self.0.dead.store(true, Ordering::SeqCst);
    }

    /// 之后的 SFTP 子系统请求都失败
    pub fn refuse_sftp(&self) {
        self.0.sftp_refused.store(true, Ordering::SeqCst);
    }

    pub fn add_dir(&self, path: &str) {
        self.0.files.lock().insert(path.to_string(), MemoryNode::Dir);
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.0
            .files
            .lock()
            .insert(path.to_string(), MemoryNode::File(data.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.0.files.lock().get(path) {
            Some(MemoryNode::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        is_memory_dir(&self.0.files.lock(), path)
    }

    pub fn sftp_opened(&self) -> usize {
        self.0.sftp_opened.load(Ordering::SeqCst)
    }

    /// 服务端已结束的 SFTP 会话数
    pub fn sftp_closed(&self) -> usize {
        self.0.sftp_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_shell(&self, _pty: &PtyRequest) -> Result<TerminalChannel, SshError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = output_buffer::channel(DEFAULT_MAX_BUFFERED_BYTES);
        let writable = Arc::new(AtomicBool::new(true));
        self.0.shells.lock().push(ShellRemote {
            cmd_rx,
            event_tx,
            writable: writable.clone(),
        });
        Ok(TerminalChannel::from_parts(cmd_tx, event_rx, writable))
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, SshError> {
        self.0.execs.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .0
            .responses
            .lock()
            .get(command)
            .cloned()
            .unwrap_or_default())
    }

    async fn open_sftp(&self) -> Result<SftpSession, SshError> {
        if self.0.sftp_refused.load(Ordering::SeqCst) {
            return Err(SshError::ChannelFailed(
                "sftp subsystem unavailable".to_string(),
            ));
        }
        self.0.sftp_opened.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(64 * 1024);
        russh_sftp::server::run(
            server,
            MemorySftp {
                files: self.0.files.clone(),
                handles: HashMap::new(),
                next_handle: 0,
                closed: self.0.sftp_closed.clone(),
            },
        )
        .await;

        SftpSession::new(client)
            .await
            .map_err(|e| SshError::ChannelFailed(e.to_string()))
    }

    fn is_alive(&self) -> bool {
        !self.0.dead.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), SshError> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        self.drop_link();
        Ok(())
    }
}

/// 计数握手次数的 Connector
#[derive(Default)]
pub struct MockConnector {
    attempts: AtomicUsize,
    delay: Duration,
    failure: Mutex<Option<String>>,
    transports: Mutex<Vec<MockTransport>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// 之后的握手都以认证失败结束
    pub fn fail_with(&self, reason: &str) {
        *self.failure.lock() = Some(reason.to_string());
    }

    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn transport(&self, index: usize) -> MockTransport {
        self.transports.lock()[index].clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self, _config: &SshConfig) -> Result<MockTransport, SshError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failure = self.failure.lock().clone();
        if let Some(reason) = failure {
            return Err(SshError::Auth(reason));
        }
        let transport = MockTransport::new();
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

// ======================== 内存 SFTP 服务端 ========================

#[derive(Debug, Clone)]
enum MemoryNode {
    Dir,
    File(Vec<u8>),
}

enum OpenHandle {
    File(String),
    Dir { path: String, listed: bool },
}

/// 路径 -> 节点的内存文件系统，根目录总是存在
struct MemorySftp {
    files: Arc<Mutex<BTreeMap<String, MemoryNode>>>,
    handles: HashMap<String, OpenHandle>,
    next_handle: u32,
    closed: Arc<AtomicUsize>,
}

/// 服务端任务结束时 drop
impl Drop for MemorySftp {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn is_memory_dir(files: &BTreeMap<String, MemoryNode>, path: &str) -> bool {
    path == "/" || matches!(files.get(path), Some(MemoryNode::Dir))
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn node_attrs(node: &MemoryNode) -> FileAttributes {
    let mut attrs = FileAttributes::default();
    match node {
        MemoryNode::Dir => {
            attrs.permissions = Some(0o040755);
            attrs.size = Some(4096);
        }
        MemoryNode::File(data) => {
            attrs.permissions = Some(0o100644);
            attrs.size = Some(data.len() as u64);
        }
    }
    attrs.mtime = Some(1_700_000_000);
    attrs
}

impl MemorySftp {
    fn new_handle(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let name = format!("h{}", self.next_handle);
        self.handles.insert(name.clone(), handle);
        name
    }

    fn open_file(&mut self, path: String, flags: OpenFlags) -> Result<String, StatusCode> {
        {
            let mut files = self.files.lock();
            let exists = matches!(files.get(&path), Some(MemoryNode::File(_)));
            if flags.contains(OpenFlags::CREATE) {
                if !is_memory_dir(&files, parent_of(&path)) || is_memory_dir(&files, &path) {
                    return Err(StatusCode::NoSuchFile);
                }
                if !exists || flags.contains(OpenFlags::TRUNCATE) {
                    files.insert(path.clone(), MemoryNode::File(Vec::new()));
                }
            } else if !exists {
                return Err(StatusCode::NoSuchFile);
            }
        }
        Ok(self.new_handle(OpenHandle::File(path)))
    }

    fn file_path(&self, handle: &str) -> Result<String, StatusCode> {
        match self.handles.get(handle) {
            Some(OpenHandle::File(path)) => Ok(path.clone()),
            _ => Err(StatusCode::Failure),
        }
    }

    fn read_at(&self, handle: &str, offset: u64, len: u32) -> Result<Vec<u8>, StatusCode> {
        let path = self.file_path(handle)?;
        let files = self.files.lock();
        let Some(MemoryNode::File(data)) = files.get(&path) else {
            return Err(StatusCode::NoSuchFile);
        };
        let start = offset as usize;
        if start >= data.len() {
            return Err(StatusCode::Eof);
        }
        let end = (start + len as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write_at(&self, handle: &str, offset: u64, chunk: &[u8]) -> Result<(), StatusCode> {
        let path = self.file_path(handle)?;
        let mut files = self.files.lock();
        let Some(MemoryNode::File(data)) = files.get_mut(&path) else {
            return Err(StatusCode::NoSuchFile);
        };
        let start = offset as usize;
        if data.len() < start + chunk.len() {
            data.resize(start + chunk.len(), 0);
        }
        data[start..start + chunk.len()].copy_from_slice(chunk);
        Ok(())
    }

    /// 目录内容只返回一次，之后返回 Eof
    fn list_once(&mut self, handle: &str) -> Result<Vec<File>, StatusCode> {
        let Some(OpenHandle::Dir { path, listed }) = self.handles.get_mut(handle) else {
            return Err(StatusCode::Failure);
        };
        if *listed {
            return Err(StatusCode::Eof);
        }
        *listed = true;

        let mut entries = vec![
            File::new(".", node_attrs(&MemoryNode::Dir)),
            File::new("..", node_attrs(&MemoryNode::Dir)),
        ];
        let files = self.files.lock();
        for (child, node) in files.iter() {
            if child != "/" && parent_of(child) == path.as_str() {
                let name = child.rsplit('/').next().unwrap_or(child);
                entries.push(File::new(name, node_attrs(node)));
            }
        }
        Ok(entries)
    }

    fn rename_tree(&self, from: &str, to: &str) -> Result<(), StatusCode> {
        let mut files = self.files.lock();
        if !files.contains_key(from) {
            return Err(StatusCode::NoSuchFile);
        }
        if files.contains_key(to) {
            return Err(StatusCode::Failure);
        }
        let prefix = format!("{}/", from);
        let moved: Vec<String> = files
            .keys()
            .filter(|key| key.as_str() == from || key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = files.remove(&key) {
                files.insert(format!("{}{}", to, &key[from.len()..]), node);
            }
        }
        Ok(())
    }
}

impl russh_sftp::server::Handler for MemorySftp {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = if path == "." {
            "/home/u".to_string()
        } else {
            path
        };
        Ok(Name {
            id,
            files: vec![File::dummy(resolved)],
        })
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        if !is_memory_dir(&self.files.lock(), &path) {
            return Err(StatusCode::NoSuchFile);
        }
        let handle = self.new_handle(OpenHandle::Dir {
            path,
            listed: false,
        });
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let files = self.list_once(&handle)?;
        Ok(Name { id, files })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let handle = self.open_file(filename, pflags)?;
        Ok(Handle { id, handle })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let data = self.read_at(&handle, offset, len)?;
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        self.write_at(&handle, offset, &data)?;
        Ok(ok_status(id))
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.handles.remove(&handle);
        Ok(ok_status(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let mut files = self.files.lock();
        if files.contains_key(&path) || !is_memory_dir(&files, parent_of(&path)) {
            return Err(StatusCode::Failure);
        }
        files.insert(path, MemoryNode::Dir);
        Ok(ok_status(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let mut files = self.files.lock();
        match files.get(&filename) {
            Some(MemoryNode::File(_)) => {
                files.remove(&filename);
                Ok(ok_status(id))
            }
            Some(MemoryNode::Dir) => Err(StatusCode::Failure),
            None => Err(StatusCode::NoSuchFile),
        }
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        self.rename_tree(&oldpath, &newpath)?;
        Ok(ok_status(id))
    }
}
