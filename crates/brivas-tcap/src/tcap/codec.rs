//! Message codec boundary and the default BER implementation

use super::asn1::{self, TlvReader};
use super::messages::{
    tag, AbortCause, AbortMessage, ApplicationContext, ComponentPortion, ConversationMessage,
    DialogPortion, PAbortCause, PackageType, QueryMessage, ResponseMessage, TcapMessage,
    UniMessage, UnidentifiedMessage,
};
use crate::errors::ParseError;
use crate::types::TransactionId;
use bytes::{Bytes, BytesMut};

/// Encoder/decoder for TCAP packages
///
/// Decoders either succeed, fail with a [`ParseError`] (optionally naming
/// the abort cause to signal back), or are never asked: the dispatcher only
/// calls the decoder matching the envelope tag.
pub trait MessageCodec: Send + Sync {
    /// Envelope tag of a raw payload
    fn read_tag(&self, data: &[u8]) -> Option<u8> {
        data.first().copied()
    }

    fn decode_query(&self, data: &[u8]) -> Result<QueryMessage, ParseError>;

    fn decode_conversation(&self, data: &[u8]) -> Result<ConversationMessage, ParseError>;

    fn decode_response(&self, data: &[u8]) -> Result<ResponseMessage, ParseError>;

    fn decode_abort(&self, data: &[u8]) -> Result<AbortMessage, ParseError>;

    fn decode_uni(&self, data: &[u8]) -> Result<UniMessage, ParseError>;

    /// Recover whatever transaction ids can be read from a payload that failed a full decode
    fn decode_unidentified(&self, data: &[u8]) -> UnidentifiedMessage;

    fn encode(&self, message: &TcapMessage) -> Bytes;
}

/// BER codec for ANSI TCAP envelopes
#[derive(Debug, Clone, Copy, Default)]
pub struct BerCodec;

/// Package content split into its elements
#[derive(Default)]
struct Elements<'a> {
    transaction_ids: &'a [u8],
    dialog_portion: Option<DialogPortion>,
    components: Option<ComponentPortion>,
    p_abort_cause: Option<u8>,
    user_abort: Option<&'a [u8]>,
}

impl BerCodec {
    fn open<'a>(
        &self,
        data: &'a [u8],
        expected: &[PackageType],
    ) -> Result<(PackageType, Elements<'a>), ParseError> {
        let (outer, content, _) = asn1::decode_tagged(data)
            .ok_or_else(|| ParseError::new("truncated package"))?;
        let package = PackageType::from_tag(outer)
            .filter(|p| expected.contains(p))
            .ok_or_else(|| ParseError::new(format!("unexpected package tag 0x{:02X}", outer)))?;

        let mut reader = TlvReader::new(content);
        let transaction_ids = match reader.read() {
            Some((tag::TRANSACTION_ID, value)) => value,
            _ => {
                return Err(ParseError::with_cause(
                    PAbortCause::BadlyStructuredTransactionPortion,
                    "missing transaction id element",
                ))
            }
        };

        let mut elements = Elements {
            transaction_ids,
            ..Default::default()
        };

        while !reader.is_empty() {
            let (t, value) = reader.read().ok_or_else(|| {
                ParseError::with_cause(
                    PAbortCause::BadlyStructuredDialoguePortion,
                    "truncated package element",
                )
            })?;
            match t {
                tag::DIALOG_PORTION => elements.dialog_portion = Some(decode_dialog_portion(value)?),
                tag::COMPONENT_SEQUENCE => {
                    elements.components = Some(ComponentPortion(Bytes::copy_from_slice(value)))
                }
                tag::P_ABORT_CAUSE => elements.p_abort_cause = value.first().copied(),
                tag::USER_ABORT_INFORMATION => elements.user_abort = Some(value),
                _ => {}
            }
        }

        Ok((package, elements))
    }
}

fn transaction_ids(raw: &[u8], expected: usize) -> Result<Vec<TransactionId>, ParseError> {
    if raw.len() != expected * TransactionId::LEN {
        return Err(ParseError::with_cause(
            PAbortCause::BadlyStructuredTransactionPortion,
            format!("transaction id element has {} octets, expected {}", raw.len(), expected * TransactionId::LEN),
        ));
    }
    Ok(raw
        .chunks_exact(TransactionId::LEN)
        .filter_map(TransactionId::from_slice)
        .collect())
}

fn decode_dialog_portion(data: &[u8]) -> Result<DialogPortion, ParseError> {
    let bad = || {
        ParseError::with_cause(
            PAbortCause::BadlyStructuredDialoguePortion,
            "malformed dialog portion",
        )
    };

    let mut portion = DialogPortion::default();
    let mut reader = TlvReader::new(data);
    while !reader.is_empty() {
        let (t, value) = reader.read().ok_or_else(bad)?;
        match t {
            tag::APPLICATION_CONTEXT_INTEGER => {
                portion.application_context =
                    Some(ApplicationContext::Integer(asn1::decode_unsigned(value).ok_or_else(bad)?));
            }
            tag::APPLICATION_CONTEXT_OID => {
                portion.application_context =
                    Some(ApplicationContext::Oid(asn1::decode_oid(value).ok_or_else(bad)?));
            }
            _ => {}
        }
    }
    Ok(portion)
}

fn encode_dialog_portion(buf: &mut BytesMut, portion: &DialogPortion) {
    let mut content = BytesMut::new();
    match &portion.application_context {
        Some(ApplicationContext::Integer(v)) => {
            asn1::encode_unsigned(&mut content, tag::APPLICATION_CONTEXT_INTEGER, *v)
        }
        Some(ApplicationContext::Oid(oid)) => {
            asn1::encode_tagged(&mut content, tag::APPLICATION_CONTEXT_OID, &asn1::encode_oid(oid))
        }
        None => {}
    }
    asn1::encode_tagged(buf, tag::DIALOG_PORTION, &content);
}

fn encode_body(
    content: &mut BytesMut,
    ids: &[TransactionId],
    dialog_portion: &Option<DialogPortion>,
    components: &Option<ComponentPortion>,
) {
    let raw: Vec<u8> = ids.iter().flat_map(|id| id.to_bytes()).collect();
    asn1::encode_tagged(content, tag::TRANSACTION_ID, &raw);
    if let Some(dp) = dialog_portion {
        encode_dialog_portion(content, dp);
    }
    if let Some(comps) = components {
        asn1::encode_tagged(content, tag::COMPONENT_SEQUENCE, &comps.0);
    }
}

impl MessageCodec for BerCodec {
    fn decode_query(&self, data: &[u8]) -> Result<QueryMessage, ParseError> {
        let (package, el) = self.open(data, &[PackageType::QueryWithPerm, PackageType::QueryWithoutPerm])?;
        let ids = transaction_ids(el.transaction_ids, 1)?;
        Ok(QueryMessage {
            with_permission: package == PackageType::QueryWithPerm,
            originating_transaction_id: ids[0],
            dialog_portion: el.dialog_portion,
            components: el.components,
        })
    }

    fn decode_conversation(&self, data: &[u8]) -> Result<ConversationMessage, ParseError> {
        let (package, el) = self.open(
            data,
            &[PackageType::ConversationWithPerm, PackageType::ConversationWithoutPerm],
        )?;
        let ids = transaction_ids(el.transaction_ids, 2)?;
        Ok(ConversationMessage {
            with_permission: package == PackageType::ConversationWithPerm,
            originating_transaction_id: ids[0],
            destination_transaction_id: ids[1],
            dialog_portion: el.dialog_portion,
            components: el.components,
        })
    }

    fn decode_response(&self, data: &[u8]) -> Result<ResponseMessage, ParseError> {
        let (_, el) = self.open(data, &[PackageType::Response])?;
        let ids = transaction_ids(el.transaction_ids, 1)?;
        Ok(ResponseMessage {
            destination_transaction_id: ids[0],
            dialog_portion: el.dialog_portion,
            components: el.components,
        })
    }

    fn decode_abort(&self, data: &[u8]) -> Result<AbortMessage, ParseError> {
        let (_, el) = self.open(data, &[PackageType::Abort])?;
        let ids = transaction_ids(el.transaction_ids, 1)?;
        let cause = match (el.p_abort_cause, el.user_abort) {
            (Some(code), _) => AbortCause::Provider(
                PAbortCause::from_u8(code)
                    .ok_or_else(|| ParseError::new(format!("unknown P-abort cause {}", code)))?,
            ),
            (None, Some(info)) => AbortCause::User(Bytes::copy_from_slice(info)),
            (None, None) => AbortCause::User(Bytes::new()),
        };
        Ok(AbortMessage {
            destination_transaction_id: ids[0],
            dialog_portion: el.dialog_portion,
            cause,
        })
    }

    fn decode_uni(&self, data: &[u8]) -> Result<UniMessage, ParseError> {
        let (_, el) = self.open(data, &[PackageType::Uni])?;
        transaction_ids(el.transaction_ids, 0)?;
        Ok(UniMessage {
            dialog_portion: el.dialog_portion,
            components: el.components,
        })
    }

    fn decode_unidentified(&self, data: &[u8]) -> UnidentifiedMessage {
        let mut msg = UnidentifiedMessage {
            tag: data.first().copied(),
            ..Default::default()
        };

        // Tolerate a truncated outer length: read as far as the bytes go
        let content = match asn1::decode_length(data.get(1..).unwrap_or_default()) {
            Some((len, header)) => {
                let start = (1 + header).min(data.len());
                let end = (1 + header + len).min(data.len());
                &data[start..end]
            }
            None => return msg,
        };

        if let Some((tag::TRANSACTION_ID, ids, _)) = asn1::decode_tagged(content) {
            if ids.len() == 4 || ids.len() == 8 {
                msg.originating_transaction_id = TransactionId::from_slice(&ids[..4]);
            }
            if ids.len() == 8 {
                msg.destination_transaction_id = TransactionId::from_slice(&ids[4..]);
            }
        }
        msg
    }

    fn encode(&self, message: &TcapMessage) -> Bytes {
        let mut content = BytesMut::with_capacity(256);

        match message {
            TcapMessage::Query(m) => encode_body(
                &mut content,
                &[m.originating_transaction_id],
                &m.dialog_portion,
                &m.components,
            ),
            TcapMessage::Conversation(m) => encode_body(
                &mut content,
                &[m.originating_transaction_id, m.destination_transaction_id],
                &m.dialog_portion,
                &m.components,
            ),
            TcapMessage::Response(m) => encode_body(
                &mut content,
                &[m.destination_transaction_id],
                &m.dialog_portion,
                &m.components,
            ),
            TcapMessage::Abort(m) => {
                encode_body(&mut content, &[m.destination_transaction_id], &m.dialog_portion, &None);
                match &m.cause {
                    AbortCause::Provider(cause) => {
                        asn1::encode_tagged(&mut content, tag::P_ABORT_CAUSE, &[*cause as u8])
                    }
                    AbortCause::User(info) => {
                        asn1::encode_tagged(&mut content, tag::USER_ABORT_INFORMATION, info)
                    }
                }
            }
            TcapMessage::Uni(m) => encode_body(&mut content, &[], &m.dialog_portion, &m.components),
        }

        let mut buf = BytesMut::with_capacity(content.len() + 4);
        asn1::encode_tagged(&mut buf, message.package_type().tag(), &content);
        buf.freeze()
    }
}
