use std::fmt::{Display, Write};
use std::marker::PhantomData;
use std::str::FromStr;

use bytes::{Buf, BytesMut};

use tokio_util::codec::{Decoder, Encoder};

pub const MAX_LINE_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum PvRequest {
    Get(String),
    Put(String, f64),
    Malformed(String),
}

impl Display for PvRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PvRequest::Get(name) => write!(f, "GET {name}"),
            PvRequest::Put(name, value) => write!(f, "PUT {name} {value:?}"),
            PvRequest::Malformed(line) => write!(f, "{line}"),
        }
    }
}

impl FromStr for PvRequest {
    type Err = std::convert::Infallible;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words = line.split_whitespace().collect::<Vec<_>>();
        Ok(match words.as_slice() {
            ["GET", name] => PvRequest::Get(name.to_string()),
            ["PUT", name, value] => match value.parse::<f64>() {
                Ok(v) => PvRequest::Put(name.to_string(), v),
                Err(_) => PvRequest::Malformed(line.to_owned()),
            },
            _ => PvRequest::Malformed(line.to_owned()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PvResponse {
    Ok(f64),
    Err(String),
}

impl Display for PvResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // {:?} keeps the shortest representation that parses back exactly
            PvResponse::Ok(v) => write!(f, "OK {v:?}"),
            PvResponse::Err(msg) => write!(f, "ERR {}", msg.replace('\n', " ")),
        }
    }
}

impl FromStr for PvResponse {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, <Self as FromStr>::Err> {
        if let Some(v) = line.strip_prefix("OK ") {
            v.trim()
                .parse::<f64>()
                .map(PvResponse::Ok)
                .map_err(|e| format!("Invalid value in response '{line}': {e}"))
        } else if let Some(msg) = line.strip_prefix("ERR") {
            Ok(PvResponse::Err(msg.trim().to_owned()))
        } else {
            Err(format!("Unexpected response '{line}'"))
        }
    }
}

/// Newline-delimited text frames: decodes `In`, encodes `Out`.
pub struct LineCodec<In, Out> {
    _p: PhantomData<fn(Out) -> In>,
}

impl<In, Out> Default for LineCodec<In, Out> {
    fn default() -> Self {
        Self { _p: PhantomData }
    }
}

/// Client side: sends requests, reads responses
pub type PvClientCodec = LineCodec<PvResponse, PvRequest>;

/// Server side: reads requests, sends responses
pub type PvServerCodec = LineCodec<PvRequest, PvResponse>;

impl<In, Out> Decoder for LineCodec<In, Out>
where
    In: FromStr,
    In::Err: Display,
{
    type Item = In;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        use std::io::{Error, ErrorKind};

        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > MAX_LINE_LEN {
                return Err(Error::new(ErrorKind::InvalidData, "Line too long"));
            }
            return Ok(None);
        };

        let line = src.split_to(pos);
        src.advance(1);

        let line = std::str::from_utf8(&line)
            .map_err(|e| Error::new(ErrorKind::InvalidData, e))?
            .trim_end_matches('\r');
        tracing::trace!("<< {}", line);

        line.parse::<In>()
            .map(Some)
            .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))
    }
}

impl<In, Out: Display> Encoder<Out> for LineCodec<In, Out> {
    type Error = std::io::Error;

    fn encode(&mut self, item: Out, buf: &mut BytesMut) -> Result<(), Self::Error> {
        tracing::trace!(">> {}", item);
        buf.write_fmt(format_args!("{}\n", item)).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to write to buffer: {}", e),
            )
        })
    }
}
