//! 离线分析一个延迟渲染管线的 RenderGraph
//!
//! 在不依赖 GPU 的 `RgDummyDevice` 上构建、编译并执行若干帧，打印执行计划和显存池统计。
//!
//! 用法：`rg_plan [settings.toml]`，未指定时尝试读取 `resources/rg_settings.toml`。

use std::rc::Rc;

use anyhow::Result;
use ash::vk;
use ash::vk::Handle;
use truvis_crate_tools::init_log::init_log;
use truvis_crate_tools::resource::TruvisPath;
use truvis_render_graph::render_graph::{
    RenderGraph, RgBufferDesc, RgDummyDevice, RgImageDesc, RgImageState, RgResourceUsage, RgSettings,
};

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;

fn load_settings() -> Result<RgSettings> {
    if let Some(path) = std::env::args().nth(1) {
        return RgSettings::from_file(path);
    }

    let default_path = TruvisPath::resources_path("rg_settings.toml");
    if default_path.exists() {
        RgSettings::from_file(default_path)
    } else {
        log::info!("{:?} not found, using default settings", default_path);
        Ok(RgSettings::default())
    }
}

fn declare_deferred(graph: &mut RenderGraph<'_>) {
    let color = |format: vk::Format| {
        RgImageDesc::new_2d(WIDTH, HEIGHT, format, vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED)
    };

    graph.import_image(
        "swapchain",
        vk::Image::from_raw(0x1000),
        vk::ImageView::from_raw(0x1001),
        RgImageDesc::new_2d(WIDTH, HEIGHT, vk::Format::B8G8R8A8_SRGB, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        RgImageState::PRESENT,
        RgImageState::PRESENT,
    );
    graph.create_image("gbuffer_albedo", color(vk::Format::R8G8B8A8_UNORM), false);
    graph.create_image("gbuffer_normal", color(vk::Format::R16G16B16A16_SFLOAT), false);
    graph.create_image(
        "depth",
        RgImageDesc::new_2d(
            WIDTH,
            HEIGHT,
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        ),
        false,
    );
    graph.create_image("hdr", color(vk::Format::R16G16B16A16_SFLOAT), false);
    graph.create_image(
        "taa_history",
        color(vk::Format::R16G16B16A16_SFLOAT).with_usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED),
        true,
    );
    graph.create_image("ldr", color(vk::Format::R8G8B8A8_UNORM), false);
    graph.create_buffer(
        "light_list",
        RgBufferDesc::new(64 * 1024, vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST),
        false,
    );

    graph.add_transfer_pass("UploadLights", |builder| {
        builder.write("light_list", RgResourceUsage::TransferDst);
    });
    graph.add_pass("GBuffer", |builder| {
        builder.write("gbuffer_albedo", RgResourceUsage::ColorAttachment);
        builder.write("gbuffer_normal", RgResourceUsage::ColorAttachment);
        builder.write("depth", RgResourceUsage::DepthAttachment);
    });
    graph.add_compute_pass("Lighting", |builder| {
        builder.read("light_list", RgResourceUsage::ShaderRead);
        builder.read("gbuffer_albedo", RgResourceUsage::ShaderRead);
        builder.read("gbuffer_normal", RgResourceUsage::ShaderRead);
        builder.read("depth", RgResourceUsage::ShaderRead);
        builder.write("hdr", RgResourceUsage::ShaderWrite);
    });
    graph.add_compute_pass("TAA", |builder| {
        builder.read("hdr", RgResourceUsage::ShaderRead);
        builder.read_write("taa_history", RgResourceUsage::ShaderWrite);
    });
    graph.add_pass("Tonemap", |builder| {
        builder.read("taa_history", RgResourceUsage::ShaderRead);
        builder.write("ldr", RgResourceUsage::ColorAttachment);
    });
    graph.add_pass("NormalDebug", |builder| {
        builder.create_image("debug_view", color(vk::Format::R8G8B8A8_UNORM), false);
        builder.read("gbuffer_normal", RgResourceUsage::ShaderRead);
        builder.write("debug_view", RgResourceUsage::ColorAttachment);
    });
    graph.add_transfer_pass("Blit", |builder| {
        builder.read("ldr", RgResourceUsage::TransferSrc);
        builder.write("swapchain", RgResourceUsage::TransferDst);
    });
}

fn main() -> Result<()> {
    init_log();

    let settings = load_settings()?;
    let fif_count = settings.fif_count;
    let device = Rc::new(RgDummyDevice::new());
    let mut graph = RenderGraph::new(device.clone(), settings);

    declare_deferred(&mut graph);
    graph.compile();
    graph.print_execution_plan();

    for frame in 0..fif_count * 2 {
        graph.execute(vk::CommandBuffer::null(), frame % fif_count);
        let commands = device.take_commands();
        log::info!(
            "frame {}: {} commands recorded, pool {} blocks / {:.1} MiB, {} live images",
            frame,
            commands.len(),
            graph.pool().block_count(),
            graph.pool().total_memory() as f64 / (1024.0 * 1024.0),
            device.live_image_count()
        );
    }

    for block in graph.pool().blocks() {
        log::info!(
            "block frame={} size={} bytes last occupant=[{}, {}]",
            block.frame_index,
            block.size,
            block.first_use,
            block.last_use
        );
    }

    graph.cleanup();
    log::info!("released, {} allocations still alive", device.allocation_count());
    Ok(())
}
