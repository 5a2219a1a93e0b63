use flint::logging;
use grabcore::host::Host;

/// Terminal implementation of the host callback surface. There is no real
/// window system here, so redraws are no-ops and the share sheet prints the
/// link instead.
pub struct TermHost {
    log: logging::Logger,
}

impl TermHost {
    pub fn new(log: &logging::Logger) -> TermHost {
        TermHost {
            log: log.new(logging::o!()),
        }
    }

    pub fn print(&self, message: &str) {
        println!("{}", message);
    }
}

impl Host for TermHost {
    fn queue_redraw(&self) {
        // The terminal renders on events; nothing to schedule.
    }

    fn log_error(&self, message: &str) {
        logging::error!(self.log, "{}", message; "context" => "host");
    }

    fn share_link(&self, link: &str, _rect: (i32, i32, i32, i32)) {
        self.print(&format!("invite link: {}", link));
    }

    fn open_link(&self, link: &str, _rect: (i32, i32, i32, i32)) {
        self.print(&format!("open: {}", link));
    }

    fn set_name_position(&self, _y_pos: i32, _max_width: i32) {}

    fn get_name_height(&self) -> i32 {
        0
    }

    fn request_name(&self) {
        self.print("enter a player name with /name <name> to start playing");
    }

    fn get_app_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_owned()
    }
}
