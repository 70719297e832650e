use super::*;

/// Output of the RPN heads for a batch, flattened in `get_anchors` order
#[derive(Debug)]
pub struct RpnOutput {
    /// [B, H * W * K] objectness logits
    pub cls_logits: Tensor,
    /// [B, H * W * K, 4] (tx, ty, tw, th) deltas
    pub deltas: Tensor,
    /// (H, W) of the backbone output
    pub feature_size: (i64, i64),
}

/// Small conv backbone followed by the Faster R-CNN RPN head
#[derive(Debug)]
pub struct RpnNetwork {
    backbone: nn::SequentialT,
    head: nn::Conv2D,
    cls: nn::Conv2D,
    reg: nn::Conv2D,
    nb_anchors: i64,
}

impl RpnNetwork {
    pub fn new(vs: &nn::Path, config: &ModelConfig, nb_anchors: i64) -> anyhow::Result<RpnNetwork> {
        ensure!(!config.channels.is_empty(), "the backbone needs at least one block");
        ensure!(
            config.pools as usize <= config.channels.len(),
            "{} pools requested but the backbone only has {} blocks",
            config.pools,
            config.channels.len()
        );
        ensure!(nb_anchors > 0, "at least one anchor shape is needed");

        let conv_cfg = nn::ConvConfig {
            padding: 1,
            ..Default::default()
        };

        let backbone_vs = vs / "backbone";
        let mut backbone = nn::seq_t();
        let mut in_channels = 3;
        for (index, &out_channels) in config.channels.iter().enumerate() {
            backbone = backbone
                .add(nn::conv2d(
                    &backbone_vs / format!("conv{}", index),
                    in_channels,
                    out_channels,
                    3,
                    conv_cfg,
                ))
                .add(nn::batch_norm2d(
                    &backbone_vs / format!("bn{}", index),
                    out_channels,
                    Default::default(),
                ))
                .add_fn(leaky_relu_with_slope);
            if index < config.pools as usize {
                backbone = backbone.add_fn(|x| x.max_pool2d_default(2));
            }
            in_channels = out_channels;
        }

        let rpn_vs = vs / "rpn";
        let head = nn::conv2d(&rpn_vs / "head", in_channels, config.head_channels, 3, conv_cfg);
        let cls = nn::conv2d(
            &rpn_vs / "cls",
            config.head_channels,
            nb_anchors,
            1,
            Default::default(),
        );
        let reg = nn::conv2d(
            &rpn_vs / "reg",
            config.head_channels,
            nb_anchors * 4,
            1,
            Default::default(),
        );

        Ok(RpnNetwork {
            backbone,
            head,
            cls,
            reg,
            nb_anchors,
        })
    }

    pub fn nb_anchors(&self) -> i64 {
        self.nb_anchors
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> anyhow::Result<RpnOutput> {
        let features = self.backbone.forward_t(xs, train);
        let (batch_size, _, height, width) = features.size4()?;
        let hidden = features.apply(&self.head).relu();

        // [B, K, H, W] -> [B, H, W, K] so anchors of the same cell stay together
        let cls_logits = hidden
            .apply(&self.cls)
            .permute([0, 2, 3, 1])
            .reshape([batch_size, -1]);
        let deltas = hidden
            .apply(&self.reg)
            .permute([0, 2, 3, 1])
            .reshape([batch_size, -1, 4]);

        Ok(RpnOutput {
            cls_logits,
            deltas,
            feature_size: (height, width),
        })
    }
}
