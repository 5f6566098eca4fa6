use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use etude_core::parser::{ParseOutcome, RecvBuffer, RequestParser};
use etude_core::timer::TimerList;
use std::time::{Duration, Instant};

const GET: &[u8] = b"GET /judge.html HTTP/1.1\r\nHost: localhost:9006\r\nUser-Agent: bench\r\nAccept: */*\r\nConnection: keep-alive\r\n\r\n";
const POST: &[u8] = b"POST /login HTTP/1.1\r\nHost: localhost:9006\r\nContent-Length: 26\r\nConnection: keep-alive\r\n\r\nuser=alice&password=secret";

fn parse_once(raw: &[u8], chunk: usize) -> ParseOutcome {
    let mut buf = RecvBuffer::new();
    let mut parser = RequestParser::new();
    let mut outcome = ParseOutcome::Incomplete;
    for piece in raw.chunks(chunk) {
        buf.push(piece);
        outcome = parser.parse(&mut buf, "judge.html");
        if outcome != ParseOutcome::Incomplete {
            break;
        }
    }
    outcome
}

fn bench_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser");
    for (name, raw) in [("get", GET), ("post", POST)] {
        group.throughput(Throughput::Bytes(raw.len() as u64));
        for chunk in [raw.len(), 16, 1] {
            group.bench_with_input(BenchmarkId::new(name, chunk), &chunk, |b, &chunk| {
                b.iter(|| parse_once(black_box(raw), chunk))
            });
        }
    }
    group.finish();
}

fn bench_timers(c: &mut Criterion) {
    c.bench_function("timer_renew_1k", |b| {
        let base = Instant::now();
        let mut list = TimerList::new();
        let ids: Vec<_> = (0..1000u64)
            .map(|i| list.add(base + Duration::from_millis(i), i))
            .collect();
        let mut step = 1000u64;
        b.iter(|| {
            // Renewing a connection moves it to the tail.
            let id = ids[(step % 1000) as usize];
            step += 1;
            list.adjust(id, base + Duration::from_millis(step));
        })
    });
}

criterion_group!(benches, bench_parser, bench_timers);
criterion_main!(benches);
