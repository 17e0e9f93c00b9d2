use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Workspace-wide error type.
///
/// Peer input must never panic a worker: every parsing function in the
/// protocol crates returns `Result` with one of the variants below. The
/// session layer decides which kinds drop the packet and which terminate
/// the connection (see `Error::is_fatal`).
#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //Bitstream/AMF errors
    #[error("buffer too short")]
    ErrShortBuffer,
    #[error("wrong marshal size")]
    WrongMarshalSize,
    #[error("amf0: unknown marker {0:#04x}")]
    UnknownAmfMarker(u8),
    #[error("amf0: truncated value")]
    AmfTruncated,
    #[error("amf0: object missing end marker")]
    AmfMissingObjectEnd,
    #[error("amf0: expected {0}")]
    AmfUnexpectedType(&'static str),
    #[error("adts: bad syncword")]
    AdtsBadSyncword,
    #[error("adts: header too short")]
    AdtsHeaderTooShort,
    #[error("adts: frame length {0} exceeds input")]
    AdtsFrameTruncated(usize),

    //MPEG-TS errors
    #[error("ts: bad sync byte {0:#04x}")]
    BadSync(u8),
    #[error("ts: packet must be 188 bytes, got {0}")]
    BadTsPacketSize(usize),
    #[error("ts: section crc mismatch")]
    CrcMismatch,
    #[error("ts: section too short")]
    SectionTooShort,
    #[error("ts: pes header too short")]
    PesHeaderTooShort,
    #[error("ts: pes start code invalid")]
    BadPesStartCode,
    #[error("ts: payload exceeds single pes capacity")]
    PesTooLarge,

    //RTMP errors
    #[error("rtmp: handshake version {0} not supported")]
    HandshakeVersion(u8),
    #[error("rtmp: handshake payload truncated")]
    HandshakeTruncated,
    #[error("rtmp: first chunk of cid {0} must be fmt 0")]
    BadChunkStart(u32),
    #[error("rtmp: fmt 0 chunk while message in progress on cid {0}")]
    ChunkRestart(u32),
    #[error("rtmp: continuation chunk does not match accumulator")]
    ChunkContinuationMismatch,
    #[error("rtmp: chunk size {0} invalid")]
    ChunkSizeInvalid(i32),
    #[error("rtmp: unknown command {0}")]
    UnknownCommand(String),
    #[error("rtmp: unexpected message type {0}")]
    UnexpectedMessageType(u8),
    #[error("rtmp: transaction {0} has no outstanding request")]
    UnknownTransaction(u64),
    #[error("rtmp: message length {0} exceeds limit")]
    MessageTooLarge(usize),

    //RTP errors
    #[error("rtp: header too short")]
    RtpHeaderTooShort,
    #[error("rtp: bad version {0}")]
    BadRtpVersion(u8),
    #[error("rtp: extension truncated")]
    RtpExtensionTruncated,
    #[error("rtp: payload exceeds mtu and cannot be fragmented")]
    PayloadNotFragmentable,

    //RTCP errors
    #[error("rtcp: bad length")]
    BadRtcpLength,
    #[error("rtcp: bad version {0}")]
    BadRtcpVersion(u8),
    #[error("rtcp: empty compound packet")]
    EmptyCompound,
    #[error("rtcp: packet status count overflow")]
    TwccStatusOverflow,
    #[error("rtcp: delta exceeds representable range")]
    TwccDeltaOverflow,

    //SRTP errors
    #[error("srtp: auth tag mismatch")]
    SrtpAuthFailed,
    #[error("srtcp: auth tag mismatch")]
    SrtcpAuthFailed,
    #[error("srtp: packet too short")]
    SrtpTooShort,
    #[error("srtp: replayed packet")]
    SrtpReplayed,
    #[error("srtp: bad key length")]
    SrtpBadKeyLength,

    //STUN errors
    #[error("stun: header too short")]
    StunHeaderTooShort,
    #[error("stun: bad magic cookie {0:#010x}")]
    BadMagicCookie(u32),
    #[error("stun: attribute truncated")]
    StunAttributeTruncated,
    #[error("stun: fingerprint mismatch")]
    FingerprintMismatch,
    #[error("stun: message integrity mismatch")]
    IntegrityMismatch,
    #[error("stun: unexpected message class")]
    UnexpectedStunClass,

    //SDP errors
    #[error("sdp: missing v= line")]
    SdpMissingVersion,
    #[error("sdp: malformed line: {0}")]
    SdpBadLine(String),
    #[error("sdp: no compatible codec for m-line {0}")]
    NoCompatibleCodec(usize),

    //Session errors
    #[error("duplicate ssrc {0}")]
    DuplicateSsrc(u32),
    #[error("unknown ssrc {0}")]
    UnknownSsrc(u32),
    #[error("dtls handshake: {0}")]
    DtlsHandshake(String),
    #[error("session closed")]
    SessionClosed,
    #[error("transport closed")]
    TransportClosed,
    #[error("i/o timeout")]
    Timeout,

    //Hub errors
    #[error("stream busy: {0}")]
    StreamBusy(String),
    #[error("consumer queue overflow")]
    QueueOverflow,
    #[error("too many streams")]
    TooManyStreams,
    #[error("source gone")]
    SourceGone,
    #[error("end of stream")]
    EndOfStream,

    //SRT errors
    #[error("srt: malformed streamid: {0}")]
    StreamIdMalformed(String),
    #[error("srt: streamid mode {0} not supported")]
    StreamIdMode(String),

    //Feature gates
    #[error("codec {0} not enabled")]
    CodecNotEnabled(String),
    #[error("feature {0} is off")]
    FeatureOff(String),

    #[error("mutex poison: {0}")]
    PoisonError(String),
    #[error("io error: {0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the session must terminate on this error.
    ///
    /// Malformed-packet kinds drop the current datagram or chunk and keep
    /// the connection; protocol violations and transport loss do not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DuplicateSsrc(_)
                | Error::StreamBusy(_)
                | Error::ChunkSizeInvalid(_)
                | Error::UnknownCommand(_)
                | Error::SessionClosed
                | Error::TransportClosed
                | Error::ChunkRestart(_)
                | Error::ChunkContinuationMismatch
        )
    }
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<FromUtf8Error> for Error {
    fn from(e: FromUtf8Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::PoisonError(e.to_string())
    }
}
