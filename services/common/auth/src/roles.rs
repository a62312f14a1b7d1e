pub const ROLE_ADMIN: &str = "admin";
