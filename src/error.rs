#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no configuration file found")]
    NO_CONFIG,

    #[error("concentrator start failure")]
    LGW_START_ERROR,

    #[error("unintended concentrator reset detected")]
    LGW_SPURIOUS_RESET,

    #[error("socket option failure on a live socket")]
    SOCKOPT_ERROR,
}
