//! Wire messages of the circuit relay v2 protocols.
//!
//! Hand-rolled [`MessageRead`]/[`MessageWrite`] implementations instead of
//! codegen output: enum fields are validated on read, so a `type` or
//! `status` carrying an unknown discriminant is a decode error rather than
//! silently collapsing to the default variant. Unknown fields are skipped.

use quick_protobuf::{
    sizeofs::{sizeof_len, sizeof_varint},
    BytesReader, MessageRead, MessageWrite, Result, Writer, WriterBackend,
};

fn unknown_enum(field: &'static str, value: i32) -> quick_protobuf::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("unknown {field} discriminant {value}"),
    )
    .into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 100,
    ReservationRefused = 200,
    ResourceLimitExceeded = 201,
    PermissionDenied = 202,
    ConnectionFailed = 203,
    NoReservation = 204,
    MalformedMessage = 400,
    UnexpectedMessage = 401,
}

impl Status {
    fn from_wire(value: i32) -> Option<Self> {
        match value {
            100 => Some(Status::Ok),
            200 => Some(Status::ReservationRefused),
            201 => Some(Status::ResourceLimitExceeded),
            202 => Some(Status::PermissionDenied),
            203 => Some(Status::ConnectionFailed),
            204 => Some(Status::NoReservation),
            400 => Some(Status::MalformedMessage),
            401 => Some(Status::UnexpectedMessage),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum HopMessageType {
    #[default]
    Reserve = 0,
    Connect = 1,
    Status = 2,
}

impl HopMessageType {
    fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(HopMessageType::Reserve),
            1 => Some(HopMessageType::Connect),
            2 => Some(HopMessageType::Status),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StopMessageType {
    #[default]
    Connect = 0,
    Status = 1,
}

impl StopMessageType {
    fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(StopMessageType::Connect),
            1 => Some(StopMessageType::Status),
            _ => None,
        }
    }
}

#[derive(Debug, Default, PartialEq, Clone)]
pub struct Peer {
    pub id: Vec<u8>,
    pub addrs: Vec<Vec<u8>>,
}

impl<'a> MessageRead<'a> for Peer {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.id = r.read_bytes(bytes)?.to_owned(),
                Ok(18) => msg.addrs.push(r.read_bytes(bytes)?.to_owned()),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Peer {
    fn get_size(&self) -> usize {
        1 + sizeof_len(self.id.len())
            + self
                .addrs
                .iter()
                .map(|a| 1 + sizeof_len(a.len()))
                .sum::<usize>()
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(10, |w| w.write_bytes(&self.id))?;
        for a in &self.addrs {
            w.write_with_tag(18, |w| w.write_bytes(a))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Clone)]
pub struct Reservation {
    pub expire: u64,
    pub addrs: Vec<Vec<u8>>,
    pub voucher: Option<Vec<u8>>,
}

impl<'a> MessageRead<'a> for Reservation {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.expire = r.read_uint64(bytes)?,
                Ok(18) => msg.addrs.push(r.read_bytes(bytes)?.to_owned()),
                Ok(26) => msg.voucher = Some(r.read_bytes(bytes)?.to_owned()),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Reservation {
    fn get_size(&self) -> usize {
        1 + sizeof_varint(self.expire)
            + self
                .addrs
                .iter()
                .map(|a| 1 + sizeof_len(a.len()))
                .sum::<usize>()
            + self
                .voucher
                .as_ref()
                .map_or(0, |v| 1 + sizeof_len(v.len()))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(8, |w| w.write_uint64(self.expire))?;
        for a in &self.addrs {
            w.write_with_tag(18, |w| w.write_bytes(a))?;
        }
        if let Some(ref v) = self.voucher {
            w.write_with_tag(26, |w| w.write_bytes(v))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Limit {
    pub duration: Option<u32>,
    pub data: Option<u64>,
}

impl<'a> MessageRead<'a> for Limit {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.duration = Some(r.read_uint32(bytes)?),
                Ok(16) => msg.data = Some(r.read_uint64(bytes)?),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Limit {
    fn get_size(&self) -> usize {
        self.duration
            .map_or(0, |d| 1 + sizeof_varint(u64::from(d)))
            + self.data.map_or(0, |d| 1 + sizeof_varint(d))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        if let Some(d) = self.duration {
            w.write_with_tag(8, |w| w.write_uint32(d))?;
        }
        if let Some(d) = self.data {
            w.write_with_tag(16, |w| w.write_uint64(d))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Clone)]
pub struct HopMessage {
    pub type_pb: HopMessageType,
    pub peer: Option<Peer>,
    pub reservation: Option<Reservation>,
    pub limit: Option<Limit>,
    pub status: Option<Status>,
}

impl<'a> MessageRead<'a> for HopMessage {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => {
                    let v = r.read_int32(bytes)?;
                    msg.type_pb =
                        HopMessageType::from_wire(v).ok_or_else(|| unknown_enum("type", v))?;
                }
                Ok(18) => msg.peer = Some(r.read_message::<Peer>(bytes)?),
                Ok(26) => msg.reservation = Some(r.read_message::<Reservation>(bytes)?),
                Ok(34) => msg.limit = Some(r.read_message::<Limit>(bytes)?),
                Ok(40) => {
                    let v = r.read_int32(bytes)?;
                    msg.status = Some(Status::from_wire(v).ok_or_else(|| unknown_enum("status", v))?);
                }
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for HopMessage {
    fn get_size(&self) -> usize {
        1 + sizeof_varint(self.type_pb as u64)
            + self.peer.as_ref().map_or(0, |m| 1 + sizeof_len(m.get_size()))
            + self
                .reservation
                .as_ref()
                .map_or(0, |m| 1 + sizeof_len(m.get_size()))
            + self
                .limit
                .as_ref()
                .map_or(0, |m| 1 + sizeof_len(m.get_size()))
            + self.status.map_or(0, |s| 1 + sizeof_varint(s as u64))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(8, |w| w.write_enum(self.type_pb as i32))?;
        if let Some(ref m) = self.peer {
            w.write_with_tag(18, |w| w.write_message(m))?;
        }
        if let Some(ref m) = self.reservation {
            w.write_with_tag(26, |w| w.write_message(m))?;
        }
        if let Some(ref m) = self.limit {
            w.write_with_tag(34, |w| w.write_message(m))?;
        }
        if let Some(s) = self.status {
            w.write_with_tag(40, |w| w.write_enum(s as i32))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Clone)]
pub struct StopMessage {
    pub type_pb: StopMessageType,
    pub peer: Option<Peer>,
    pub limit: Option<Limit>,
    pub status: Option<Status>,
}

impl<'a> MessageRead<'a> for StopMessage {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => {
                    let v = r.read_int32(bytes)?;
                    msg.type_pb =
                        StopMessageType::from_wire(v).ok_or_else(|| unknown_enum("type", v))?;
                }
                Ok(18) => msg.peer = Some(r.read_message::<Peer>(bytes)?),
                Ok(26) => msg.limit = Some(r.read_message::<Limit>(bytes)?),
                Ok(32) => {
                    let v = r.read_int32(bytes)?;
                    msg.status = Some(Status::from_wire(v).ok_or_else(|| unknown_enum("status", v))?);
                }
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for StopMessage {
    fn get_size(&self) -> usize {
        1 + sizeof_varint(self.type_pb as u64)
            + self.peer.as_ref().map_or(0, |m| 1 + sizeof_len(m.get_size()))
            + self
                .limit
                .as_ref()
                .map_or(0, |m| 1 + sizeof_len(m.get_size()))
            + self.status.map_or(0, |s| 1 + sizeof_varint(s as u64))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(8, |w| w.write_enum(self.type_pb as i32))?;
        if let Some(ref m) = self.peer {
            w.write_with_tag(18, |w| w.write_message(m))?;
        }
        if let Some(ref m) = self.limit {
            w.write_with_tag(26, |w| w.write_message(m))?;
        }
        if let Some(s) = self.status {
            w.write_with_tag(32, |w| w.write_enum(s as i32))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quick_protobuf::Writer;

    fn encode<M: MessageWrite>(msg: &M) -> Vec<u8> {
        let mut buf = Vec::with_capacity(msg.get_size());
        let mut writer = Writer::new(&mut buf);
        msg.write_message(&mut writer).unwrap();
        buf
    }

    fn decode<'a, M: MessageRead<'a>>(bytes: &'a [u8]) -> quick_protobuf::Result<M> {
        let mut reader = BytesReader::from_bytes(bytes);
        M::from_reader(&mut reader, bytes)
    }

    #[test]
    fn hop_message_roundtrip() {
        let msg = HopMessage {
            type_pb: HopMessageType::Status,
            peer: Some(Peer {
                id: vec![1, 2, 3],
                addrs: vec![vec![4, 5], vec![6]],
            }),
            reservation: Some(Reservation {
                expire: 1_700_000_000,
                addrs: vec![vec![7, 8]],
                voucher: None,
            }),
            limit: Some(Limit {
                duration: Some(120),
                data: Some(1 << 17),
            }),
            status: Some(Status::Ok),
        };

        let bytes = encode(&msg);
        assert_eq!(bytes.len(), msg.get_size());
        assert_eq!(decode::<HopMessage>(&bytes).unwrap(), msg);
    }

    #[test]
    fn stop_message_roundtrip() {
        let msg = StopMessage {
            type_pb: StopMessageType::Connect,
            peer: Some(Peer {
                id: vec![9],
                addrs: vec![],
            }),
            limit: Some(Limit {
                duration: Some(0),
                data: None,
            }),
            status: None,
        };

        let bytes = encode(&msg);
        assert_eq!(decode::<StopMessage>(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_type_discriminant_is_an_error() {
        // field 1, varint, value 7: no such hop message type.
        let bytes = [0x08, 0x07];
        decode::<HopMessage>(&bytes).unwrap_err();
    }

    #[test]
    fn unknown_status_discriminant_is_an_error() {
        // type RESERVE followed by field 5, varint, value 999.
        let mut bytes = vec![0x08, 0x00, 0x28];
        bytes.extend_from_slice(&[0xe7, 0x07]);
        decode::<HopMessage>(&bytes).unwrap_err();
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut bytes = encode(&HopMessage {
            type_pb: HopMessageType::Reserve,
            ..Default::default()
        });
        // field 9, length-delimited, 2 payload bytes.
        bytes.extend_from_slice(&[0x4a, 0x02, 0xff, 0xff]);

        let msg = decode::<HopMessage>(&bytes).unwrap();
        assert_eq!(msg.type_pb, HopMessageType::Reserve);
    }

    #[test]
    fn status_wire_values() {
        assert_eq!(Status::Ok as i32, 100);
        assert_eq!(Status::ReservationRefused as i32, 200);
        assert_eq!(Status::ResourceLimitExceeded as i32, 201);
        assert_eq!(Status::PermissionDenied as i32, 202);
        assert_eq!(Status::ConnectionFailed as i32, 203);
        assert_eq!(Status::NoReservation as i32, 204);
        assert_eq!(Status::MalformedMessage as i32, 400);
        assert_eq!(Status::UnexpectedMessage as i32, 401);
    }
}
