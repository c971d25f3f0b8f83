/// 控制通道协议
///
/// 控制消息作为句柄为 `CONTROL_HANDLE` 的隧道段负载传输，
/// 线上格式：`[Code:u8][PayloadLen:u16 BE][Payload]`
pub mod security;
mod stream;

pub use stream::{ControlStream, ControlStreamHandle, NoCloseStream, MAX_SECURITY_CHUNK};

use crate::error::{Result, TunnelError};
use crate::session::{SessionHandle, SessionIdentity, CONTROL_HANDLE, IDENTITY_WIRE_LEN, NULL_HANDLE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

/// 控制消息首部长度
pub const CONTROL_HEADER_LEN: usize = 3;

/// 控制消息类型码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCode {
    RegisterSession = 1,
    RemoveSession = 2,
    Security = 3,
    PackLoss = 4,
    Start = 5,
    RequireReg = 6,
}

impl ControlCode {
    pub fn from_u8(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::RegisterSession),
            2 => Ok(Self::RemoveSession),
            3 => Ok(Self::Security),
            4 => Ok(Self::PackLoss),
            5 => Ok(Self::Start),
            6 => Ok(Self::RequireReg),
            other => Err(TunnelError::violation(format!(
                "unknown control code {}",
                other
            ))),
        }
    }
}

/// 控制消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// 客户端提议句柄并登记会话标识
    RegisterSession {
        handle: SessionHandle,
        identity: SessionIdentity,
    },
    /// 服务端对登记的答复，出错时句柄为 0
    RegisterReply {
        handle: SessionHandle,
        error: Option<String>,
    },
    RemoveSession {
        handle: SessionHandle,
    },
    /// 空负载用于宣告/切换，非空负载承载 TLS 记录
    Security(Bytes),
    /// 对端丢弃计数，仅供参考
    PackLoss {
        count: u32,
    },
    Start,
    /// 服务端收到未登记句柄的数据，要求客户端重新登记
    RequireReg {
        handle: SessionHandle,
    },
}

impl ControlMessage {
    pub fn code(&self) -> ControlCode {
        match self {
            Self::RegisterSession { .. } | Self::RegisterReply { .. } => ControlCode::RegisterSession,
            Self::RemoveSession { .. } => ControlCode::RemoveSession,
            Self::Security(_) => ControlCode::Security,
            Self::PackLoss { .. } => ControlCode::PackLoss,
            Self::Start => ControlCode::Start,
            Self::RequireReg { .. } => ControlCode::RequireReg,
        }
    }

    pub fn register_ok(handle: SessionHandle) -> Self {
        Self::RegisterReply {
            handle,
            error: None,
        }
    }

    pub fn register_failed(reason: impl Into<String>) -> Self {
        Self::RegisterReply {
            handle: NULL_HANDLE,
            error: Some(reason.into()),
        }
    }

    /// 空 Security 消息：宣告或切换到加密
    pub fn security_signal() -> Self {
        Self::Security(Bytes::new())
    }

    pub fn is_security_signal(&self) -> bool {
        matches!(self, Self::Security(payload) if payload.is_empty())
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegisterSession { handle, identity } => {
                write!(f, "RegisterSession({} = {})", handle, identity)
            }
            Self::RegisterReply { handle, error: None } => write!(f, "RegisterReply({})", handle),
            Self::RegisterReply {
                error: Some(err), ..
            } => write!(f, "RegisterReply(error: {})", err),
            Self::RemoveSession { handle } => write!(f, "RemoveSession({})", handle),
            Self::Security(payload) => write!(f, "Security({} bytes)", payload.len()),
            Self::PackLoss { count } => write!(f, "PackLoss({})", count),
            Self::Start => write!(f, "Start"),
            Self::RequireReg { handle } => write!(f, "RequireReg({})", handle),
        }
    }
}

/// 编解码器所在的一端，决定 RegisterSession 负载按请求还是答复解析
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// 控制消息编解码器
#[derive(Debug, Clone)]
pub struct ControlCodec {
    role: Role,
}

impl ControlCodec {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    /// 解码一个控制段中的全部消息
    ///
    /// 段边界即消息边界，残留的半条消息属于协议违规
    pub fn decode_segment(&mut self, payload: &[u8]) -> Result<Vec<ControlMessage>> {
        let mut buf = BytesMut::from(payload);
        let mut messages = Vec::new();
        while let Some(message) = self.decode(&mut buf)? {
            messages.push(message);
        }
        if !buf.is_empty() {
            return Err(TunnelError::violation(format!(
                "{} trailing bytes in control segment",
                buf.len()
            )));
        }
        Ok(messages)
    }

    /// 把一条消息编码为独立的控制段负载
    pub fn encode_message(&mut self, message: ControlMessage) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(message, &mut buf)?;
        Ok(buf.freeze())
    }
}

fn expect_len(code: ControlCode, payload: &[u8], len: usize) -> Result<()> {
    if payload.len() != len {
        return Err(TunnelError::violation(format!(
            "{:?} payload must be {} bytes, got {}",
            code,
            len,
            payload.len()
        )));
    }
    Ok(())
}

fn data_handle(handle: SessionHandle) -> Result<SessionHandle> {
    if handle == NULL_HANDLE || handle == CONTROL_HANDLE {
        return Err(TunnelError::violation(format!(
            "handle {} is reserved",
            handle
        )));
    }
    Ok(handle)
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ControlMessage>> {
        if src.len() < CONTROL_HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[1], src[2]]) as usize;
        if src.len() < CONTROL_HEADER_LEN + len {
            src.reserve(CONTROL_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let code = ControlCode::from_u8(src.get_u8())?;
        src.advance(2);
        let mut payload = src.split_to(len).freeze();

        let message = match code {
            ControlCode::RegisterSession => match self.role {
                Role::Server => {
                    expect_len(code, &payload, 2 + IDENTITY_WIRE_LEN)?;
                    let handle = data_handle(payload.get_u16())?;
                    let identity = SessionIdentity::decode(&payload)?;
                    ControlMessage::RegisterSession { handle, identity }
                }
                Role::Client => {
                    if payload.len() < 2 {
                        return Err(TunnelError::violation(
                            "RegisterSession reply shorter than a handle",
                        ));
                    }
                    let handle = payload.get_u16();
                    let text = std::str::from_utf8(&payload)
                        .map_err(|_| TunnelError::violation("RegisterSession error is not UTF-8"))?;
                    match (handle, text.is_empty()) {
                        (NULL_HANDLE, true) => {
                            ControlMessage::register_failed("registration rejected")
                        }
                        (NULL_HANDLE, false) => ControlMessage::register_failed(text),
                        (handle, true) => ControlMessage::register_ok(data_handle(handle)?),
                        (handle, false) => {
                            return Err(TunnelError::violation(format!(
                                "RegisterSession reply for handle {} carries an error",
                                handle
                            )))
                        }
                    }
                }
            },
            ControlCode::RemoveSession => {
                expect_len(code, &payload, 2)?;
                ControlMessage::RemoveSession {
                    handle: data_handle(payload.get_u16())?,
                }
            }
            ControlCode::RequireReg => {
                expect_len(code, &payload, 2)?;
                ControlMessage::RequireReg {
                    handle: data_handle(payload.get_u16())?,
                }
            }
            ControlCode::PackLoss => {
                expect_len(code, &payload, 4)?;
                ControlMessage::PackLoss {
                    count: payload.get_u32(),
                }
            }
            ControlCode::Start => {
                expect_len(code, &payload, 0)?;
                ControlMessage::Start
            }
            ControlCode::Security => ControlMessage::Security(payload),
        };
        Ok(Some(message))
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = TunnelError;

    fn encode(&mut self, message: ControlMessage, dst: &mut BytesMut) -> Result<()> {
        let mut payload = BytesMut::new();
        match &message {
            ControlMessage::RegisterSession { handle, identity } => {
                payload.put_u16(*handle);
                identity.encode(&mut payload);
            }
            ControlMessage::RegisterReply { handle, error } => {
                payload.put_u16(*handle);
                if let Some(error) = error {
                    payload.put_slice(error.as_bytes());
                }
            }
            ControlMessage::RemoveSession { handle } | ControlMessage::RequireReg { handle } => {
                payload.put_u16(*handle)
            }
            ControlMessage::Security(data) => payload.put_slice(data),
            ControlMessage::PackLoss { count } => payload.put_u32(*count),
            ControlMessage::Start => {}
        }

        let len = u16::try_from(payload.len()).map_err(|_| {
            TunnelError::violation(format!("control payload of {} bytes", payload.len()))
        })?;
        dst.reserve(CONTROL_HEADER_LEN + payload.len());
        dst.put_u8(message.code() as u8);
        dst.put_u16(len);
        dst.put_slice(&payload);
        Ok(())
    }
}

/// 控制通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    /// 隧道内 TLS 交换进行中
    Securing,
    /// 已切换到加密
    Secured,
    /// 客户端已发出 Start，等待答复
    StartSent,
    Proxying,
}

/// 控制通道状态机
///
/// `Idle -> (Securing -> Secured)? -> Proxying`；引擎在收发每条控制消息时
/// 调用 `on_send`/`on_recv`，违反顺序的消息返回协议违规
#[derive(Debug)]
pub struct ControlMachine {
    role: Role,
    require_security: bool,
    state: ControlState,
    pending_registrations: usize,
}

impl ControlMachine {
    pub fn new(role: Role, require_security: bool) -> Self {
        Self {
            role,
            require_security,
            state: ControlState::Idle,
            pending_registrations: 0,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn is_proxying(&self) -> bool {
        self.state == ControlState::Proxying
    }

    pub fn pending_registrations(&self) -> usize {
        self.pending_registrations
    }

    fn violation(&self, message: &ControlMessage) -> TunnelError {
        TunnelError::violation(format!(
            "{} not allowed in state {:?} ({:?} side)",
            message, self.state, self.role
        ))
    }

    /// 本端准备发送消息
    pub fn on_send(&mut self, message: &ControlMessage) -> Result<()> {
        use ControlState::*;
        match (self.role, message, self.state) {
            (_, ControlMessage::PackLoss { .. }, _) => {}
            (_, _, Securing) if !matches!(message, ControlMessage::Security(_)) => {
                return Err(self.violation(message))
            }

            (Role::Client, ControlMessage::RegisterSession { .. }, _) => {
                self.pending_registrations += 1;
            }
            (Role::Client, ControlMessage::RemoveSession { .. }, _) => {}
            (Role::Client, ControlMessage::Security(p), Idle) if p.is_empty() => {
                self.state = Securing;
            }
            (Role::Client, ControlMessage::Security(p), Securing) if p.is_empty() => {
                self.state = Secured;
            }
            (Role::Client, ControlMessage::Security(_), Securing) => {}
            (Role::Client, ControlMessage::Start, Secured) => self.state = StartSent,
            (Role::Client, ControlMessage::Start, Idle) if !self.require_security => {
                self.state = StartSent
            }

            (Role::Server, ControlMessage::RegisterReply { .. }, _) => {}
            (Role::Server, ControlMessage::RemoveSession { .. }, _) => {}
            (Role::Server, ControlMessage::RequireReg { .. }, _) => {}
            (Role::Server, ControlMessage::Security(_), Securing) => {}
            (Role::Server, ControlMessage::Start, Proxying) => {}

            _ => return Err(self.violation(message)),
        }
        Ok(())
    }

    /// 收到对端消息
    pub fn on_recv(&mut self, message: &ControlMessage) -> Result<()> {
        use ControlState::*;
        match (self.role, message, self.state) {
            (_, ControlMessage::PackLoss { .. }, _) => {}
            (_, _, Securing) if !matches!(message, ControlMessage::Security(_)) => {
                return Err(self.violation(message))
            }

            (Role::Server, ControlMessage::RegisterSession { .. }, _) => {}
            (Role::Server, ControlMessage::RemoveSession { .. }, _) => {}
            (Role::Server, ControlMessage::Security(p), Idle) if p.is_empty() => {
                self.state = Securing;
            }
            (Role::Server, ControlMessage::Security(p), Securing) if p.is_empty() => {
                self.state = Secured;
            }
            (Role::Server, ControlMessage::Security(_), Securing) => {}
            (Role::Server, ControlMessage::Start, Secured) => self.state = Proxying,
            (Role::Server, ControlMessage::Start, Idle) if !self.require_security => {
                self.state = Proxying
            }

            (Role::Client, ControlMessage::RegisterReply { .. }, _) => {
                if self.pending_registrations == 0 {
                    return Err(TunnelError::violation("unsolicited RegisterSession reply"));
                }
                self.pending_registrations -= 1;
            }
            (Role::Client, ControlMessage::RemoveSession { .. }, _) => {}
            (Role::Client, ControlMessage::RequireReg { .. }, _) => {}
            (Role::Client, ControlMessage::Security(_), Securing) => {}
            (Role::Client, ControlMessage::Start, StartSent) => {
                if self.pending_registrations > 0 {
                    return Err(TunnelError::violation(format!(
                        "Start reply with {} registrations pending",
                        self.pending_registrations
                    )));
                }
                self.state = Proxying;
            }

            _ => return Err(self.violation(message)),
        }
        Ok(())
    }

    /// 登记请求超时被放弃
    pub fn abandon_registration(&mut self) {
        self.pending_registrations = self.pending_registrations.saturating_sub(1);
    }
}
