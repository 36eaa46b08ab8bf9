use clap::Parser;
use eframe::egui_wgpu::wgpu;
use eframe::wgpu::include_wgsl;
use eframe::{egui, wgpu::util::DeviceExt};
use encase::{ArrayLength, ShaderType, StorageBuffer};
use pixel_warp::{
    DEFAULT_GAP, DEFAULT_RADIUS, EffectError, Field, Particle, load_image, placeholder_image,
};
use std::path::PathBuf;
use std::process;
use thiserror::Error;

const PANEL_WIDTH: f32 = 200.0;

/// Scatter an image into pointer-reactive color particles.
#[derive(Parser)]
#[command(name = "pixel_warp")]
struct Cli {
    /// Source image (PNG or JPEG). A built-in test picture is used when omitted.
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Sampling stride and particle square size, in pixels.
    #[arg(short, long, default_value_t = DEFAULT_GAP, value_parser = clap::value_parser!(u32).range(1..))]
    gap: u32,

    /// Pointer interaction threshold, in squared pixels.
    #[arg(short, long, default_value_t = DEFAULT_RADIUS)]
    radius: f32,

    /// Field width in pixels, fixed at startup.
    #[arg(short = 'W', long, default_value_t = 1200)]
    width: u32,

    /// Field height in pixels, fixed at startup.
    #[arg(short = 'H', long, default_value_t = 800)]
    height: u32,
}

/// Startup errors, each mapped to a distinct exit code. The frame loop itself
/// has no failure paths.
#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Effect(#[from] EffectError),
    #[error("failed to run the window: {0}")]
    Ui(#[from] eframe::Error),
}

impl AppError {
    fn exit_code(&self) -> i32 {
        match self {
            AppError::Effect(EffectError::ZeroGap) => 10,
            AppError::Effect(EffectError::Image(_)) => 11,
            AppError::Ui(_) => 12,
        }
    }
}

#[derive(ShaderType)]
struct GpuField<'a> {
    pub size: cgmath::Vector2<f32>,
    pub gap: f32,
    pub length: ArrayLength,
    #[size(runtime)]
    pub particles: &'a [Particle],
}

struct Renderer {
    field_storage_buffer: wgpu::Buffer,
    field_storage_buffer_size: usize,
    field_bind_group_layout: wgpu::BindGroupLayout,
    field_bind_group: wgpu::BindGroup,
    particles_render_pipeline: wgpu::RenderPipeline,
}

impl Renderer {
    fn new(render_state: &eframe::egui_wgpu::RenderState) -> Self {
        let device = &render_state.device;

        let particles_shader = device.create_shader_module(include_wgsl!("./particles.wgsl"));

        let field_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Field Bind Group Layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: Some(<GpuField as ShaderType>::min_size()),
                    },
                    count: None,
                }],
            });

        const FIELD_STORAGE_BUFFER_SIZE: usize =
            <GpuField as ShaderType>::METADATA.min_size().get() as _;

        let field_storage_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Field Storage Buffer"),
            contents: &[0; FIELD_STORAGE_BUFFER_SIZE],
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::STORAGE,
        });

        let field_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Field Bind Group"),
            layout: &field_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: field_storage_buffer.as_entire_binding(),
            }],
        });

        let particles_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Particles Pipeline Layout"),
                bind_group_layouts: &[&field_bind_group_layout],
                push_constant_ranges: &[],
            });

        let particles_render_pipeline =
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Particles Render Pipeline"),
                layout: Some(&particles_pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &particles_shader,
                    entry_point: "vs_main",
                    buffers: &[],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &particles_shader,
                    entry_point: "fs_main",
                    targets: &[Some(render_state.target_format.into())],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleStrip,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });

        Self {
            field_storage_buffer,
            field_storage_buffer_size: FIELD_STORAGE_BUFFER_SIZE,
            field_bind_group_layout,
            field_bind_group,
            particles_render_pipeline,
        }
    }

    fn prepare(
        &mut self,
        field: &[u8],
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        _encoder: &wgpu::CommandEncoder,
    ) -> Vec<wgpu::CommandBuffer> {
        // The particle count is fixed after sampling, so the buffer grows at
        // most once, on the first frame.
        if self.field_storage_buffer_size >= field.len() {
            queue.write_buffer(&self.field_storage_buffer, 0, field);
        } else {
            self.field_storage_buffer =
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("Field Storage Buffer"),
                    contents: field,
                    usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::STORAGE,
                });
            self.field_storage_buffer_size = field.len();
            self.field_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Field Bind Group"),
                layout: &self.field_bind_group_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.field_storage_buffer.as_entire_binding(),
                }],
            });
        }

        vec![]
    }

    fn paint<'a>(&'a self, particle_count: u32, render_pass: &mut wgpu::RenderPass<'a>) {
        render_pass.set_pipeline(&self.particles_render_pipeline);
        render_pass.set_bind_group(0, &self.field_bind_group, &[]);
        render_pass.draw(0..4, 0..particle_count);
    }
}

struct WarpApp {
    field: Field,
    last_frame_time: std::time::Instant,
}

impl WarpApp {
    fn new(cc: &eframe::CreationContext, field: Field) -> Self {
        let render_state = cc
            .wgpu_render_state
            .as_ref()
            .expect("the wgpu renderer is required");
        let renderer = Renderer::new(render_state);
        render_state
            .renderer
            .write()
            .paint_callback_resources
            .insert(renderer);

        Self {
            field,
            last_frame_time: std::time::Instant::now(),
        }
    }
}

impl eframe::App for WarpApp {
    fn update(&mut self, ctx: &eframe::egui::Context, _frame: &mut eframe::Frame) {
        let current_time = std::time::Instant::now();
        let frame_time = current_time
            .duration_since(self.last_frame_time)
            .as_secs_f32();
        self.last_frame_time = current_time;

        egui::SidePanel::left("Control Panel")
            .default_width(PANEL_WIDTH)
            .show(ctx, |ui| {
                ui.label(format!("FPS: {:.1}", 1.0 / frame_time));
                ui.label(format!("Frame Time: {:.3}ms", frame_time * 1000.0));
                ui.label(format!("Particles: {}", self.field.particles.len()));
                ui.label(format!("Gap: {} px", self.field.gap));
                ui.label(format!("Radius: {} px\u{00b2}", self.field.radius));
                ui.separator();
                if ui.button("Warp").clicked() {
                    self.field.warp();
                }
            });

        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(ctx.style().visuals.panel_fill))
            .show(ctx, |ui| {
                let (rect, response) =
                    ui.allocate_exact_size(ui.available_size(), egui::Sense::hover());

                // The field keeps its startup dimensions and the rect scales
                // it, so hover coordinates map back into field space. Leaving
                // the rect keeps the last pointer position, the same way a
                // pointer leaving a window stops sending move events.
                if let Some(position) = response.hover_pos() {
                    let local = position - rect.min;
                    self.field.set_pointer(
                        local.x / rect.width() * self.field.width as f32,
                        local.y / rect.height() * self.field.height as f32,
                    );
                }

                let mut field_storage = StorageBuffer::new(vec![]);
                field_storage
                    .write(&GpuField {
                        size: self.field.bounds(),
                        gap: self.field.gap as f32,
                        length: ArrayLength,
                        particles: &self.field.particles,
                    })
                    .unwrap();
                let field_bytes = field_storage.into_inner();
                let particle_count = self.field.particles.len() as u32;

                ui.painter().add(egui::PaintCallback {
                    rect,
                    callback: std::sync::Arc::new(
                        eframe::egui_wgpu::CallbackFn::new()
                            .prepare(move |device, queue, encoder, paint_callback_resources| {
                                let renderer: &mut Renderer =
                                    paint_callback_resources.get_mut().unwrap();
                                renderer.prepare(&field_bytes, device, queue, encoder)
                            })
                            .paint(move |_info, render_pass, paint_callback_resources| {
                                let renderer: &Renderer = paint_callback_resources.get().unwrap();
                                renderer.paint(particle_count, render_pass);
                            }),
                    ),
                });
            });

        // Advance the simulation after handing this frame's state to the
        // painter, then ask the host for the next tick.
        self.field.update();
        ctx.request_repaint();
    }
}

fn run(cli: Cli) -> Result<(), AppError> {
    let image = match &cli.image {
        Some(path) => load_image(path)?,
        None => placeholder_image(cli.width, cli.height),
    };

    let mut field = Field::new(cli.width, cli.height, cli.gap, cli.radius)?;
    field.init(&image);
    eprintln!(
        "sampled {} particles ({}x{} field, gap {})",
        field.particles.len(),
        field.width,
        field.height,
        field.gap,
    );

    eframe::run_native(
        "Pixel Warp",
        eframe::NativeOptions {
            renderer: eframe::Renderer::Wgpu,
            initial_window_size: Some(egui::vec2(
                cli.width as f32 + PANEL_WIDTH,
                cli.height as f32,
            )),
            ..Default::default()
        },
        Box::new(move |cc| Box::new(WarpApp::new(cc, field))),
    )?;

    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        eprintln!("error: {error}");
        process::exit(error.exit_code());
    }
}
