/// Tracy 性能分析区间；只有 Tracy client 已经在运行时才会记录
macro_rules! profile_span {
    ($name:literal) => {
        tracy_client::Client::running().map(|client| client.span(tracy_client::span_location!($name), 0))
    };
}

pub mod render_graph;
