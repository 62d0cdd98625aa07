//! Trained linear-model parameters.
//!
//! Exported from the offline training pipeline; one weight per spectral bin
//! (bins 1..=44) plus the bias term. These values are part of the device
//! qualification record and must not be altered without retraining.

pub(crate) const BIAS: f64 = -4.107084483430048;

pub(crate) const WEIGHTS: [f64; 44] = [
    0.021090951280257,
    0.047861673254692,
    0.039555190662391,
    0.028143537649316,
    0.017969669373252,
    0.024893239342785,
    0.011295742080509,
    0.009705873122228,
    -0.003382590734514,
    0.006741324368931,
    -0.008764794368401,
    -0.013176861322501,
    -0.004280520361229,
    -0.017481533199845,
    -0.009867350381375,
    -0.021733936089058,
    -0.014838651910394,
    -0.011415661346896,
    -0.019301427912880,
    -0.008120620966904,
    -0.015789327842766,
    -0.005414953162219,
    -0.012160082709518,
    -0.002539572790991,
    -0.009733018001683,
    -0.006096351989719,
    -0.001185834762385,
    -0.007783843623478,
    -0.000482913032826,
    -0.005031822970027,
    0.001570615113222,
    -0.003141757322652,
    0.002850793729301,
    -0.001906769566734,
    0.000724941373988,
    -0.002582128025279,
    0.001362428837221,
    -0.000911769112345,
    0.000286213227869,
    -0.001745732298064,
    0.000659347713318,
    -0.000374185590622,
    0.000148069347119,
    -0.000852931217707,
];
