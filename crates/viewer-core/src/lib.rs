//! Viewport state machine for vertical long-image scrolling.
//!
//! Owns the visible rectangle of a tall source image and turns gesture
//! events into rectangle motion: drags shift it directly, a release above
//! the fling threshold hands it to a decelerating settle animation, and
//! every update clamps to the image bounds. The scale is fixed when an image
//! is assigned (`view_width / image_width`); the source only scrolls
//! vertically, so the rectangle always spans the full image width.
//!
//! Pure logic: no I/O, no pixels. The embedding view drives `tick` from its
//! frame clock and redraws whenever an event or tick reports motion.

use std::time::Duration;

/// Minimum release speed (px/s) for a release to start a settle animation.
pub const MIN_FLING_VELOCITY: f32 = 50.0;

/// Per-frame velocity decay at the 60 fps reference rate; ~8% is lost each
/// frame.
const MOMENTUM_DECAY: f32 = 0.92;

/// Speed (px/s) below which a settle is considered finished.
const STOP_VELOCITY: f32 = 0.5;

/// The visible rectangle in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl VisibleRect {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }
}

/// Gesture phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollState {
    Idle,
    Dragging,
    /// A fling is animating toward rest.
    Settling,
}

#[derive(Debug, Clone, Copy)]
struct Viewport {
    image_width: u32,
    image_height: u32,
    view_height: u32,
    scale: f32,
    /// Top edge of the visible rectangle in source pixels.
    top: f32,
}

impl Viewport {
    /// Height of the visible window in source pixels.
    fn visible_height(&self) -> f32 {
        self.view_height as f32 / self.scale
    }

    /// Largest valid top offset; zero when the whole image fits.
    fn max_top(&self) -> f32 {
        (self.image_height as f32 - self.visible_height()).max(0.0)
    }

    /// Pin the rectangle inside the image. Returns true if it moved.
    fn clamp(&mut self) -> bool {
        let clamped = self.top.clamp(0.0, self.max_top());
        let moved = clamped != self.top;
        self.top = clamped;
        moved
    }
}

/// Fling physics: a velocity in offset space decaying toward zero.
#[derive(Debug, Clone, Copy)]
struct Fling {
    velocity: f32,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Idle,
    Dragging,
    Settling(Fling),
}

/// Translates gestures into visible-rectangle motion for one image.
#[derive(Debug)]
pub struct ViewportController {
    view_width: u32,
    view_height: u32,
    viewport: Option<Viewport>,
    state: State,
}

impl ViewportController {
    pub fn new() -> Self {
        Self {
            view_width: 0,
            view_height: 0,
            viewport: None,
            state: State::Idle,
        }
    }

    /// Set the on-screen viewport size in pixels. Re-derives the scale for
    /// an already-assigned image.
    pub fn set_view_size(&mut self, width: u32, height: u32) {
        self.view_width = width;
        self.view_height = height;
        if let Some(viewport) = self.viewport {
            self.assign(viewport.image_width, viewport.image_height);
        }
    }

    /// Assign a source image, fixing `scale = view_width / image_width` and
    /// resetting the rectangle to the top. Any gesture or fling in progress
    /// is discarded.
    pub fn set_image(&mut self, image_width: u32, image_height: u32) {
        self.assign(image_width, image_height);
    }

    fn assign(&mut self, image_width: u32, image_height: u32) {
        self.state = State::Idle;
        if image_width == 0 || image_height == 0 || self.view_width == 0 || self.view_height == 0 {
            self.viewport = None;
            return;
        }
        let scale = self.view_width as f32 / image_width as f32;
        self.viewport = Some(Viewport {
            image_width,
            image_height,
            view_height: self.view_height,
            scale,
            top: 0.0,
        });
    }

    /// Drop the assigned image; the controller goes dormant.
    pub fn clear_image(&mut self) {
        self.viewport = None;
        self.state = State::Idle;
    }

    pub fn has_image(&self) -> bool {
        self.viewport.is_some()
    }

    pub fn state(&self) -> ScrollState {
        match self.state {
            State::Idle => ScrollState::Idle,
            State::Dragging => ScrollState::Dragging,
            State::Settling(_) => ScrollState::Settling,
        }
    }

    /// The fixed scale for the assigned image.
    pub fn scale(&self) -> Option<f32> {
        self.viewport.map(|v| v.scale)
    }

    /// The visible rectangle in source pixels. Full image width always; the
    /// bottom edge never passes the image height.
    pub fn visible_rect(&self) -> Option<VisibleRect> {
        let viewport = self.viewport?;
        let bottom = (viewport.top + viewport.visible_height())
            .min(viewport.image_height as f32);
        Some(VisibleRect {
            left: 0.0,
            top: viewport.top,
            right: viewport.image_width as f32,
            bottom,
        })
    }

    /// Touch down. Cancels an in-flight settle outright; the discarded
    /// physics state is not resumed.
    pub fn on_down(&mut self) {
        self.state = State::Dragging;
    }

    /// Drag by a scroll distance in source pixels (positive `dy` moves the
    /// window down the image). Returns true when a redraw is needed.
    pub fn on_move(&mut self, _dx: f32, dy: f32) -> bool {
        let Some(viewport) = self.viewport.as_mut() else {
            return false;
        };
        self.state = State::Dragging;
        viewport.top += dy;
        viewport.clamp();
        true
    }

    /// Release with a fling velocity in px/s (finger velocity; upward
    /// motion is negative). Below the threshold the controller goes straight
    /// to `Idle`; otherwise a settle starts toward the velocity's direction,
    /// bounded by the image. Returns true when a settle was started.
    pub fn on_fling(&mut self, _velocity_x: f32, velocity_y: f32) -> bool {
        if self.viewport.is_none() {
            self.state = State::Idle;
            return false;
        }
        if velocity_y.abs() < MIN_FLING_VELOCITY {
            self.state = State::Idle;
            return false;
        }
        // The window moves opposite to the finger.
        self.state = State::Settling(Fling {
            velocity: -velocity_y,
        });
        true
    }

    /// Gesture cancelled by the host input system.
    pub fn on_cancel(&mut self) {
        self.state = State::Idle;
    }

    /// Advance the settle animation by `dt`. Returns true when the visible
    /// rectangle changed and a redraw is needed.
    pub fn tick(&mut self, dt: Duration) -> bool {
        let State::Settling(mut fling) = self.state else {
            return false;
        };
        let Some(viewport) = self.viewport.as_mut() else {
            self.state = State::Idle;
            return false;
        };

        let dt_s = dt.as_secs_f32();
        fling.velocity *= MOMENTUM_DECAY.powf(dt_s * 60.0);
        viewport.top += fling.velocity * dt_s;

        let hit_bound = viewport.clamp();
        if hit_bound || fling.velocity.abs() < STOP_VELOCITY {
            self.state = State::Idle;
        } else {
            self.state = State::Settling(fling);
        }
        true
    }
}

impl Default for ViewportController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(view: (u32, u32), image: (u32, u32)) -> ViewportController {
        let mut c = ViewportController::new();
        c.set_view_size(view.0, view.1);
        c.set_image(image.0, image.1);
        c
    }

    fn rect(c: &ViewportController) -> VisibleRect {
        c.visible_rect().unwrap()
    }

    #[test]
    fn test_initial_rect_and_scale() {
        let c = controller((1000, 1000), (1000, 5000));
        assert_eq!(c.scale(), Some(1.0));
        let r = rect(&c);
        assert_eq!((r.left, r.top, r.right, r.bottom), (0.0, 0.0, 1000.0, 1000.0));
        assert_eq!(c.state(), ScrollState::Idle);
    }

    #[test]
    fn test_scale_follows_view_over_image_width() {
        let c = controller((1000, 1000), (2000, 8000));
        assert_eq!(c.scale(), Some(0.5));
        // The window is view_height / scale source pixels tall.
        assert_eq!(rect(&c).height(), 2000.0);
    }

    #[test]
    fn test_move_scrolls_and_clamps_at_bottom() {
        let mut c = controller((1000, 1000), (1000, 5000));
        c.on_down();

        assert!(c.on_move(0.0, 1200.0));
        let r = rect(&c);
        assert_eq!((r.top, r.bottom), (1200.0, 2200.0));

        // Raw bottom would be 6200 > 5000: pin to the bottom edge.
        assert!(c.on_move(0.0, 4000.0));
        let r = rect(&c);
        assert_eq!((r.top, r.bottom), (4000.0, 5000.0));
    }

    #[test]
    fn test_move_clamps_at_top() {
        let mut c = controller((1000, 1000), (1000, 5000));
        c.on_down();
        c.on_move(0.0, 300.0);
        c.on_move(0.0, -800.0);

        let r = rect(&c);
        assert_eq!((r.top, r.bottom), (0.0, 1000.0));
    }

    #[test]
    fn test_clamping_holds_under_arbitrary_move_sequences() {
        let mut c = controller((500, 500), (500, 3000));
        c.on_down();
        for dy in [2500.0, -90000.0, 123.0, 7000.0, -1.0, 99999.0] {
            c.on_move(0.0, dy);
            let r = rect(&c);
            assert!(r.top >= 0.0);
            assert!(r.bottom <= 3000.0);
        }
    }

    #[test]
    fn test_zero_velocity_release_goes_straight_to_idle() {
        let mut c = controller((1000, 1000), (1000, 5000));
        c.on_down();
        c.on_move(0.0, 100.0);

        assert!(!c.on_fling(0.0, 0.0));
        assert_eq!(c.state(), ScrollState::Idle);
    }

    #[test]
    fn test_sub_threshold_velocity_goes_to_idle() {
        let mut c = controller((1000, 1000), (1000, 5000));
        c.on_down();
        assert!(!c.on_fling(0.0, MIN_FLING_VELOCITY - 1.0));
        assert_eq!(c.state(), ScrollState::Idle);
    }

    #[test]
    fn test_fling_settles_downward_and_stops() {
        let mut c = controller((1000, 1000), (1000, 5000));
        c.on_down();
        // Finger moved up fast: the window should settle down the image.
        assert!(c.on_fling(0.0, -900.0));
        assert_eq!(c.state(), ScrollState::Settling);

        let mut ticks = 0;
        while c.state() == ScrollState::Settling {
            assert!(c.tick(Duration::from_millis(16)));
            let r = rect(&c);
            assert!(r.top >= 0.0 && r.bottom <= 5000.0);
            ticks += 1;
            assert!(ticks < 10_000, "settle never finished");
        }

        assert_eq!(c.state(), ScrollState::Idle);
        assert!(rect(&c).top > 0.0);
    }

    #[test]
    fn test_fling_is_bounded_by_image_bottom() {
        let mut c = controller((1000, 1000), (1000, 2000));
        c.on_down();
        c.on_fling(0.0, -50_000.0);

        while c.state() == ScrollState::Settling {
            c.tick(Duration::from_millis(16));
        }
        let r = rect(&c);
        assert_eq!((r.top, r.bottom), (1000.0, 2000.0));
    }

    #[test]
    fn test_touch_down_cancels_settling() {
        let mut c = controller((1000, 1000), (1000, 5000));
        c.on_down();
        c.on_fling(0.0, -900.0);
        assert_eq!(c.state(), ScrollState::Settling);

        c.on_down();
        assert_eq!(c.state(), ScrollState::Dragging);
        // The discarded fling no longer animates.
        assert!(!c.tick(Duration::from_millis(16)));
    }

    #[test]
    fn test_cancel_returns_to_idle() {
        let mut c = controller((1000, 1000), (1000, 5000));
        c.on_down();
        c.on_cancel();
        assert_eq!(c.state(), ScrollState::Idle);
    }

    #[test]
    fn test_no_image_means_no_motion() {
        let mut c = ViewportController::new();
        c.set_view_size(1000, 1000);

        assert!(!c.on_move(0.0, 100.0));
        assert!(!c.on_fling(0.0, 900.0));
        assert!(!c.tick(Duration::from_millis(16)));
        assert!(c.visible_rect().is_none());
    }

    #[test]
    fn test_assigning_an_image_resets_state() {
        let mut c = controller((1000, 1000), (1000, 5000));
        c.on_down();
        c.on_move(0.0, 2000.0);
        c.on_fling(0.0, -900.0);

        c.set_image(1000, 3000);
        assert_eq!(c.state(), ScrollState::Idle);
        assert_eq!(rect(&c).top, 0.0);
    }

    #[test]
    fn test_short_image_never_scrolls() {
        let mut c = controller((1000, 1000), (1000, 400));
        c.on_down();
        c.on_move(0.0, 500.0);

        let r = rect(&c);
        assert_eq!(r.top, 0.0);
        assert_eq!(r.bottom, 400.0);
    }
}
