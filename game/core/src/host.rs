/// The callback surface the embedding shell provides. The core calls these
/// to reach platform facilities it cannot own itself: scheduling a repaint,
/// the system share sheet, and the platform text-entry widget used for the
/// player name.
pub trait Host {
    /// Ask the shell to repaint at its next opportunity.
    fn queue_redraw(&self);

    /// Report a non-fatal error to the platform log.
    fn log_error(&self, message: &str);

    /// Present the system share sheet for an invite link. `rect` is the
    /// screen-space anchor (x, y, width, height) for popover placement.
    fn share_link(&self, link: &str, rect: (i32, i32, i32, i32));

    /// Open a link in the platform browser.
    fn open_link(&self, link: &str, rect: (i32, i32, i32, i32));

    /// Position the platform name-entry widget over the board.
    fn set_name_position(&self, y_pos: i32, max_width: i32);

    /// The height of the platform name-entry widget, for layout.
    fn get_name_height(&self) -> i32;

    /// Focus the name-entry widget and ask the player for a name.
    fn request_name(&self);

    fn get_app_version(&self) -> String;
}
