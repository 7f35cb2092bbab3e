use criterion::{black_box, criterion_group, criterion_main, Criterion};
use slicejobs::{
    BufferDesc, Job, JobFunction, JobPort, SerialPort, SlicedBuffer, ThreadPool, ThreadPoolPort,
    UniformBuffer, UniformDesc,
};

const NUM_ITEMS: usize = 1 << 18;
const ITEMS_PER_SLICE: usize = 1024;

fn setup_job(job: &mut Job, scale: &f32, input: &[f32], output: &mut [f32]) {
    unsafe {
        job.setup(
            UniformDesc::new().with_buffer(UniformBuffer::from_value(scale)),
            BufferDesc::new().with_buffer(SlicedBuffer::input(input, ITEMS_PER_SLICE)),
            BufferDesc::new().with_buffer(SlicedBuffer::output(output, ITEMS_PER_SLICE)),
            JobFunction::new(|mut ctx| {
                let scale = *ctx.uniform_value::<f32>(0);
                let src = ctx.input::<f32>(0);
                let dst = ctx.output::<f32>(0);
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = (s * scale).sqrt().sin();
                }
            }),
        );
    }
}

fn run(port: &mut dyn JobPort, job: &Job, output: &[f32]) {
    port.push_job(job);
    port.wait_done().unwrap();
    black_box(output);
}

fn scale_slices(c: &mut Criterion) {
    let scale = 2.0f32;
    let input: Vec<f32> = (0..NUM_ITEMS).map(|i| i as f32).collect();
    let mut output = vec![0.0f32; NUM_ITEMS];

    let mut group = c.benchmark_group("scale_256k");

    group.bench_function("serial", |b| {
        let mut port = SerialPort::new("bench");
        let mut job = Job::new();
        setup_job(&mut job, &scale, &input, &mut output);
        b.iter(|| run(&mut port, &job, &output));
        job.discard();
    });

    group.bench_function("thread_pool", |b| {
        let pool = ThreadPool::builder().build();
        let mut port = ThreadPoolPort::new(&pool, "bench");
        let mut job = Job::new();
        setup_job(&mut job, &scale, &input, &mut output);
        b.iter(|| run(&mut port, &job, &output));
        job.discard();
        pool.shut_down().wait();
    });

    group.finish();
}

fn chained_slices(c: &mut Criterion) {
    let scale = 0.5f32;
    let input: Vec<f32> = (0..NUM_ITEMS).map(|i| i as f32).collect();
    let mut temp = vec![0.0f32; NUM_ITEMS];
    let mut output = vec![0.0f32; NUM_ITEMS];

    let pool = ThreadPool::builder().build();
    let mut port = ThreadPoolPort::new(&pool, "chain");

    let mut first = Job::new();
    let mut second = Job::new();
    setup_job(&mut first, &scale, &input, &mut temp);
    setup_job(&mut second, &scale, &temp, &mut output);

    c.bench_function("chain_2x256k", |b| {
        b.iter(|| {
            port.push_job_chain(&[&first, &second]);
            port.wait_done().unwrap();
            black_box(&output);
        })
    });

    first.discard();
    second.discard();
    pool.shut_down().wait();
}

criterion_group!(benches, scale_slices, chained_slices);
criterion_main!(benches);
