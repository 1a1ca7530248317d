//! Wire decoder for MEXC's compressed spot deals stream.
//!
//! The spot websocket pushes protobuf-encoded wrapper messages. Only a
//! handful of fields matter to us, so this is a hand-rolled tag/wire-type
//! reader instead of a generated schema: varint (0), 64-bit (1),
//! length-delimited (2) and 32-bit (5) wire types, everything else treated
//! as malformed. Unknown fields are skipped by length.
//!
//! Wrapper layout (field numbers):
//! ```text
//! 1    channel        string
//! 3    symbol         string
//! 5    create_time    int64
//! 6    send_time      int64
//! 301..=315           length-delimited sub-messages, one per channel kind;
//!                     314 = aggregated public deals
//! ```
//!
//! Deals message: repeated field 1, each item
//! `{price: string(1), quantity: string(2), trade_type: int32(3), time: int64(4)}`.

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Field number of the aggregated deals sub-message in the wrapper.
const FIELD_AGGRE_DEALS: u32 = 314;

/// One aggregated trade from the deals stream.
///
/// Price and quantity stay as decimal strings; the exchange sends them that
/// way and the consumer decides the numeric type.
#[derive(Debug, Clone, PartialEq)]
pub struct AggreDeal {
    pub price: String,
    pub quantity: String,
    pub trade_type: i32,
    pub time: i64,
}

/// Decoded subset of the push wrapper.
#[derive(Debug, Clone, Default)]
pub struct PushWrapper {
    pub channel: Option<String>,
    pub symbol: Option<String>,
    pub create_time: Option<i64>,
    pub send_time: Option<i64>,
    pub deals: Vec<AggreDeal>,
}

/// Decode a wrapper message, returning the first deal it carries.
///
/// Returns `None` for malformed input or a wrapper without deals; the
/// caller drops the frame either way.
pub fn decode_first_deal(buf: &[u8]) -> Option<AggreDeal> {
    decode_wrapper(buf).and_then(|w| w.deals.into_iter().next())
}

/// Decode the wrapper subset. `None` on any malformed byte.
pub fn decode_wrapper(buf: &[u8]) -> Option<PushWrapper> {
    let mut r = Reader::new(buf);
    let mut out = PushWrapper::default();

    while !r.done() {
        let (field, wire) = r.read_tag()?;
        match (field, wire) {
            (1, WIRE_LEN) => out.channel = Some(r.read_string()?),
            (3, WIRE_LEN) => out.symbol = Some(r.read_string()?),
            (5, WIRE_VARINT) => out.create_time = Some(r.read_int64()?),
            (6, WIRE_VARINT) => out.send_time = Some(r.read_int64()?),
            (FIELD_AGGRE_DEALS, WIRE_LEN) => {
                let body = r.read_bytes()?;
                out.deals = decode_deals(body)?;
            }
            // Other channel payloads (301..=315) and anything unexpected:
            // skip by wire type.
            _ => r.skip(wire)?,
        }
    }

    Some(out)
}

fn decode_deals(buf: &[u8]) -> Option<Vec<AggreDeal>> {
    let mut r = Reader::new(buf);
    let mut deals = Vec::new();

    while !r.done() {
        let (field, wire) = r.read_tag()?;
        match (field, wire) {
            (1, WIRE_LEN) => {
                let body = r.read_bytes()?;
                deals.push(decode_deal(body)?);
            }
            _ => r.skip(wire)?,
        }
    }

    Some(deals)
}

fn decode_deal(buf: &[u8]) -> Option<AggreDeal> {
    let mut r = Reader::new(buf);
    let mut price = String::new();
    let mut quantity = String::new();
    let mut trade_type = 0i32;
    let mut time = 0i64;

    while !r.done() {
        let (field, wire) = r.read_tag()?;
        match (field, wire) {
            (1, WIRE_LEN) => price = r.read_string()?,
            (2, WIRE_LEN) => quantity = r.read_string()?,
            (3, WIRE_VARINT) => trade_type = r.read_int64()? as i32,
            (4, WIRE_VARINT) => time = r.read_int64()?,
            _ => r.skip(wire)?,
        }
    }

    Some(AggreDeal {
        price,
        quantity,
        trade_type,
        time,
    })
}

/// Streaming byte reader with an offset cursor.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Varint, 7 bits per byte with continuation bit; int64 spans up to
    /// ten bytes.
    fn read_varint(&mut self) -> Option<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;

        loop {
            let byte = *self.buf.get(self.pos)?;
            self.pos += 1;

            if shift < 64 {
                value |= u64::from(byte & 0x7f) << shift;
            }
            if byte & 0x80 == 0 {
                return Some(value);
            }

            shift += 7;
            if shift >= 70 {
                // More than ten bytes: malformed.
                return None;
            }
        }
    }

    /// Negative values arrive as ten-byte varints; reinterpreting the u64
    /// keeps the two's complement intact.
    fn read_int64(&mut self) -> Option<i64> {
        self.read_varint().map(|v| v as i64)
    }

    fn read_tag(&mut self) -> Option<(u32, u8)> {
        let tag = self.read_varint()?;
        let field = (tag >> 3) as u32;
        let wire = (tag & 0x7) as u8;
        if field == 0 {
            return None;
        }
        Some((field, wire))
    }

    fn read_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.read_varint()? as usize;
        let end = self.pos.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Some(out)
    }

    fn read_string(&mut self) -> Option<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    fn skip(&mut self, wire: u8) -> Option<()> {
        match wire {
            WIRE_VARINT => {
                self.read_varint()?;
            }
            WIRE_FIXED64 => {
                let end = self.pos.checked_add(8)?;
                if end > self.buf.len() {
                    return None;
                }
                self.pos = end;
            }
            WIRE_LEN => {
                self.read_bytes()?;
            }
            WIRE_FIXED32 => {
                let end = self.pos.checked_add(4)?;
                if end > self.buf.len() {
                    return None;
                }
                self.pos = end;
            }
            _ => return None,
        }
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal wire writer so the tests can assert encode-then-decode
    /// identity without a schema compiler.
    struct Writer {
        buf: Vec<u8>,
    }

    impl Writer {
        fn new() -> Self {
            Self { buf: Vec::new() }
        }

        fn varint(&mut self, mut v: u64) -> &mut Self {
            loop {
                let byte = (v & 0x7f) as u8;
                v >>= 7;
                if v == 0 {
                    self.buf.push(byte);
                    return self;
                }
                self.buf.push(byte | 0x80);
            }
        }

        fn tag(&mut self, field: u32, wire: u8) -> &mut Self {
            self.varint((u64::from(field) << 3) | u64::from(wire))
        }

        fn string(&mut self, field: u32, s: &str) -> &mut Self {
            self.tag(field, WIRE_LEN).varint(s.len() as u64);
            self.buf.extend_from_slice(s.as_bytes());
            self
        }

        fn int64(&mut self, field: u32, v: i64) -> &mut Self {
            self.tag(field, WIRE_VARINT).varint(v as u64)
        }

        fn message(&mut self, field: u32, body: &[u8]) -> &mut Self {
            self.tag(field, WIRE_LEN).varint(body.len() as u64);
            self.buf.extend_from_slice(body);
            self
        }

        fn finish(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.buf)
        }
    }

    fn encode_deal(deal: &AggreDeal) -> Vec<u8> {
        let mut w = Writer::new();
        w.string(1, &deal.price)
            .string(2, &deal.quantity)
            .int64(3, i64::from(deal.trade_type))
            .int64(4, deal.time)
            .finish()
    }

    fn encode_deals(deals: &[AggreDeal]) -> Vec<u8> {
        let mut w = Writer::new();
        for deal in deals {
            let body = encode_deal(deal);
            w.message(1, &body);
        }
        w.finish()
    }

    fn sample_deal() -> AggreDeal {
        AggreDeal {
            price: "0.5".to_string(),
            quantity: "10".to_string(),
            trade_type: 1,
            time: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_decode_deals_wrapper() {
        let deals_body = encode_deals(&[sample_deal()]);
        let mut w = Writer::new();
        let bytes = w
            .string(1, "spot@public.aggre.deals.v3.api.pb@100ms@BTCUSDT")
            .string(3, "BTCUSDT")
            .int64(6, 1_700_000_000_123)
            .message(FIELD_AGGRE_DEALS, &deals_body)
            .finish();

        let deal = decode_first_deal(&bytes).expect("deal");
        assert_eq!(deal.price, "0.5");
        assert_eq!(deal.quantity, "10");
        assert_eq!(deal.time, 1_700_000_000_000);

        let wrapper = decode_wrapper(&bytes).expect("wrapper");
        assert_eq!(wrapper.symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(wrapper.send_time, Some(1_700_000_000_123));
    }

    #[test]
    fn test_wrapper_roundtrip() {
        let deals = vec![
            sample_deal(),
            AggreDeal {
                price: "0.49".to_string(),
                quantity: "3.25".to_string(),
                trade_type: 2,
                time: 1_700_000_000_500,
            },
        ];
        let deals_body = encode_deals(&deals);
        let mut w = Writer::new();
        let bytes = w
            .string(1, "chan")
            .string(3, "ETHUSDT")
            .int64(5, 42)
            .int64(6, 43)
            .message(FIELD_AGGRE_DEALS, &deals_body)
            .finish();

        let wrapper = decode_wrapper(&bytes).expect("wrapper");
        assert_eq!(wrapper.channel.as_deref(), Some("chan"));
        assert_eq!(wrapper.create_time, Some(42));
        assert_eq!(wrapper.send_time, Some(43));
        assert_eq!(wrapper.deals, deals);
    }

    #[test]
    fn test_trailing_unknown_fields_are_skipped() {
        let deals_body = encode_deals(&[sample_deal()]);
        let mut w = Writer::new();
        w.message(FIELD_AGGRE_DEALS, &deals_body);
        // Unknown trailing fields of every supported wire type.
        w.int64(200, 7);
        w.string(201, "ignored");
        w.tag(202, WIRE_FIXED64);
        w.buf.extend_from_slice(&0u64.to_le_bytes());
        w.tag(203, WIRE_FIXED32);
        w.buf.extend_from_slice(&0u32.to_le_bytes());
        let bytes = w.finish();

        assert_eq!(decode_first_deal(&bytes), Some(sample_deal()));
    }

    #[test]
    fn test_other_channel_submessages_are_skipped() {
        // 301 and 315 are sibling channel payloads we do not decode.
        let deals_body = encode_deals(&[sample_deal()]);
        let mut w = Writer::new();
        let bytes = w
            .message(301, b"\x0a\x03abc")
            .message(FIELD_AGGRE_DEALS, &deals_body)
            .message(315, b"")
            .finish();

        assert_eq!(decode_first_deal(&bytes), Some(sample_deal()));
    }

    #[test]
    fn test_negative_int64_ten_byte_varint() {
        let mut w = Writer::new();
        let bytes = w.int64(5, -1).finish();
        // -1 occupies the full ten bytes on the wire.
        assert_eq!(bytes.len(), 1 + 10);

        let wrapper = decode_wrapper(&bytes).expect("wrapper");
        assert_eq!(wrapper.create_time, Some(-1));
    }

    #[test]
    fn test_no_deals_yields_none() {
        let mut w = Writer::new();
        let bytes = w.string(1, "chan").string(3, "BTCUSDT").finish();
        assert!(decode_first_deal(&bytes).is_none());

        let empty_container = Writer::new().message(FIELD_AGGRE_DEALS, &[]).finish();
        assert!(decode_first_deal(&empty_container).is_none());
    }

    #[test]
    fn test_malformed_inputs_fail_gracefully() {
        // Truncated length-delimited field.
        assert!(decode_wrapper(&[0x0a, 0x10, 0x61]).is_none());
        // Varint longer than ten bytes.
        assert!(decode_wrapper(&[0x28; 1]).is_none());
        assert!(decode_wrapper(&[0x28, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01]).is_none());
        // Unsupported wire type (start-group).
        assert!(decode_wrapper(&[0x0b]).is_none());
        // Field number zero.
        assert!(decode_wrapper(&[0x00]).is_none());
    }
}
