use std::hint::black_box;
use std::sync::Arc;

use bytes::BytesMut;
use criterion::{Criterion, criterion_group, criterion_main};
use protocol::{
    ClientCodec, Command, ContainerInfo, HandshakeResponse, NoPending, PendingLookup,
    ProtocolVersion, Response, ResponseBody, Variable, VariableType, VariableValue,
    VariablesResponse,
};
use tokio_util::codec::Decoder;

struct AllVariables;

impl PendingLookup for AllVariables {
    fn command_for(&self, _request_id: u32) -> Option<Command> {
        Some(Command::Variables)
    }
}

fn variables_response(count: usize) -> Response {
    let variables = (0..count)
        .map(|i| {
            let mut var = Variable::new(format!("key{i}"), VariableType::String)
                .with_value(VariableValue::String(format!("value number {i}")));
            if i % 10 == 0 {
                var.variable_type = VariableType::AssociativeArray;
                var.value = None;
                var.container = Some(ContainerInfo {
                    key_type: VariableType::String,
                    element_count: 10,
                });
            }
            var
        })
        .collect();
    Response::ok(1, ResponseBody::Variables(VariablesResponse { variables }))
}

fn bench_decode(c: &mut Criterion) {
    let version = ProtocolVersion::V3_2_0;
    let encoded = variables_response(500).encode(version).unwrap();

    c.bench_function("decode_variables_500", |b| {
        b.iter(|| Response::decode(black_box(&encoded), Command::Variables, version).unwrap())
    });

    let handshake = HandshakeResponse {
        magic: "bsdebug".into(),
        protocol_version: version,
        revision_timestamp: Some(0),
    }
    .encode()
    .unwrap();

    c.bench_function("frame_variables_500", |b| {
        b.iter(|| {
            let mut codec = ClientCodec::new(Arc::new(AllVariables));
            let mut buf = BytesMut::from(&handshake[..]);
            codec.decode(&mut buf).unwrap();
            buf.extend_from_slice(&encoded);
            black_box(codec.decode(&mut buf).unwrap())
        })
    });

    c.bench_function("skip_stale_response", |b| {
        b.iter(|| {
            let mut codec = ClientCodec::new(Arc::new(NoPending));
            let mut buf = BytesMut::from(&handshake[..]);
            codec.decode(&mut buf).unwrap();
            buf.extend_from_slice(&encoded);
            black_box(codec.decode(&mut buf).unwrap())
        })
    });
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
